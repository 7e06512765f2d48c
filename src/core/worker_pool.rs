//! 有界工作线程池
//!
//! 用于兜底枚举时并行获取每个适配器的详细信息。每个任务从开始执行起
//! 单独计时，超时的任务被丢弃，不影响其他任务完成。

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 单个任务未能产出结果的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailure {
    /// 执行超过单任务时限
    TimedOut,
    /// 任务发生 panic
    Panicked,
    /// 所有工作线程都卡在超时任务上，任务未被执行
    Abandoned,
}

impl std::fmt::Display for PoolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolFailure::TimedOut => write!(f, "执行超时"),
            PoolFailure::Panicked => write!(f, "执行异常"),
            PoolFailure::Abandoned => write!(f, "未被执行"),
        }
    }
}

enum PoolEvent<R> {
    Started(usize, Instant),
    Finished(usize, Result<R, PoolFailure>),
}

/// 有界线程池
#[derive(Debug, Clone, Copy)]
pub struct BoundedPool {
    size: usize,
    item_timeout: Duration,
}

impl BoundedPool {
    pub fn new(size: usize, item_timeout: Duration) -> Self {
        Self {
            size: size.max(1),
            item_timeout,
        }
    }

    /// 并行执行 `job`，结果按输入顺序返回
    ///
    /// 函数返回时池即停止领取新任务；仍在执行的超时任务会在自身结束后退出，
    /// 其结果被丢弃
    pub fn run<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<Result<R, PoolFailure>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let queue: Arc<Mutex<VecDeque<(usize, T)>>> =
            Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
        let stop = Arc::new(AtomicBool::new(false));
        let job = Arc::new(job);
        let (tx, rx) = mpsc::channel::<PoolEvent<R>>();

        let workers = self.size.min(total);
        let mut spawned = 0;
        for n in 0..workers {
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            let job = Arc::clone(&job);
            let tx = tx.clone();

            let spawn_result = std::thread::Builder::new()
                .name(format!("adapter-detail-{}", n))
                .spawn(move || loop {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let next = queue.lock().pop_front();
                    let Some((index, item)) = next else {
                        break;
                    };

                    if tx.send(PoolEvent::Started(index, Instant::now())).is_err() {
                        break;
                    }
                    let result = catch_unwind(AssertUnwindSafe(|| job(item)))
                        .map_err(|_| PoolFailure::Panicked);
                    if tx.send(PoolEvent::Finished(index, result)).is_err() {
                        break;
                    }
                });

            match spawn_result {
                Ok(_) => spawned += 1,
                Err(e) => log::warn!("创建工作线程失败: {}", e),
            }
        }
        drop(tx);

        let mut results: Vec<Option<Result<R, PoolFailure>>> = (0..total).map(|_| None).collect();
        let mut started: HashMap<usize, Instant> = HashMap::new();
        let mut pending = total;
        // 已判定超时但线程仍在执行的任务数
        let mut stuck = 0usize;

        while pending > 0 && spawned > 0 {
            let now = Instant::now();

            for (&index, &at) in &started {
                if results[index].is_none() && now.duration_since(at) >= self.item_timeout {
                    results[index] = Some(Err(PoolFailure::TimedOut));
                    pending -= 1;
                    stuck += 1;
                }
            }
            if pending == 0 {
                break;
            }

            let in_flight: Vec<Instant> = started
                .iter()
                .filter(|(i, _)| results[**i].is_none())
                .map(|(_, at)| *at)
                .collect();

            if in_flight.is_empty() && stuck >= spawned {
                log::warn!("所有工作线程都被超时任务占用，放弃剩余 {} 个任务", pending);
                break;
            }

            let wait = in_flight
                .iter()
                .map(|at| (*at + self.item_timeout).saturating_duration_since(now))
                .min()
                .unwrap_or(self.item_timeout);

            match rx.recv_timeout(wait) {
                Ok(PoolEvent::Started(index, at)) => {
                    started.insert(index, at);
                }
                Ok(PoolEvent::Finished(index, result)) => {
                    if results[index].is_none() {
                        results[index] = Some(result);
                        pending -= 1;
                    } else {
                        stuck = stuck.saturating_sub(1);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        stop.store(true, Ordering::SeqCst);

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(PoolFailure::Abandoned)))
            .collect()
    }
}
