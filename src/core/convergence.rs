//! 设置生效确认
//!
//! 写入高级属性会触发网卡异步重新初始化，新值不会立刻可见。
//! 写入成功后按固定节奏重新读取当前值：先等待驱动稳定后读一次，
//! 再按重试间隔读取，直到与目标一致或次数用尽。
//! 次数用尽不算失败，写入本身已经成功。
//!
//! 状态转换：
//!
//! ```text
//! Idle ─► Applying ─► Settling ─► AwaitingConvergence(1) ─► AwaitingConvergence(2) ─► GaveUpConverging
//!   │         │          └───────────────┴──────────────────────┴──► Converged
//!   └─────────┴─► ApplyFailed
//! ```

use std::time::Duration;

use serde::Serialize;

use crate::core::cancel::CancelToken;
use crate::core::events::{EngineEvent, EventSink};

/// 轮询节奏
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSchedule {
    /// 写入后首次读取前的等待
    pub settle: Duration,
    /// 之后每次重试前的等待
    pub retries: Vec<Duration>,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(2000),
            retries: vec![Duration::from_millis(800), Duration::from_millis(1500)],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConvergenceState {
    Idle,
    Applying,
    ApplyFailed,
    /// 写入成功，等待首次读取
    Settling,
    /// 第 n 次重试读取（从 1 开始）
    AwaitingConvergence(usize),
    Converged,
    GaveUpConverging,
}

/// 确认结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConvergenceOutcome {
    /// 读到了目标值
    Converged { value: String, reads: usize },
    /// 读取次数用尽仍未读到目标值，设置可能尚未生效
    GaveUp {
        last_observed: Option<String>,
        reads: usize,
    },
}

impl ConvergenceOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceOutcome::Converged { .. })
    }
}

impl std::fmt::Display for ConvergenceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvergenceOutcome::Converged { .. } => write!(f, "设置已生效"),
            ConvergenceOutcome::GaveUp { .. } => {
                write!(f, "设置可能未立即生效，可稍后手动刷新或尝试重启适配器")
            }
        }
    }
}

/// 一次设置操作的确认状态（值对象，每次转换返回新值）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceTracker {
    alias: String,
    target: String,
    state: ConvergenceState,
    reads: usize,
    last_observed: Option<String>,
}

impl ConvergenceTracker {
    pub fn new(alias: &str, target: &str) -> Self {
        Self {
            alias: alias.to_string(),
            target: target.trim().to_string(),
            state: ConvergenceState::Idle,
            reads: 0,
            last_observed: None,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ConvergenceState {
        self.state
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    pub fn begin_apply(mut self) -> Self {
        if self.state == ConvergenceState::Idle {
            self.state = ConvergenceState::Applying;
        }
        self
    }

    /// 前置条件不满足，未执行任何写入
    pub fn reject(mut self) -> Self {
        if matches!(self.state, ConvergenceState::Idle | ConvergenceState::Applying) {
            self.state = ConvergenceState::ApplyFailed;
        }
        self
    }

    pub fn apply_finished(mut self, ok: bool) -> Self {
        if self.state == ConvergenceState::Applying {
            self.state = if ok {
                ConvergenceState::Settling
            } else {
                ConvergenceState::ApplyFailed
            };
        }
        self
    }

    /// 下一次读取前需要等待的时间；没有待进行的读取时为 None
    pub fn next_delay(&self, schedule: &PollSchedule) -> Option<Duration> {
        match self.state {
            ConvergenceState::Settling => Some(schedule.settle),
            ConvergenceState::AwaitingConvergence(n) => schedule.retries.get(n - 1).copied(),
            _ => None,
        }
    }

    /// 记录一次读取结果；读取失败传 None，按“尚未生效”处理
    pub fn observe(mut self, observed: Option<&str>, schedule: &PollSchedule) -> Self {
        let attempt = match self.state {
            ConvergenceState::Settling => 0,
            ConvergenceState::AwaitingConvergence(n) => n,
            _ => return self,
        };

        self.reads += 1;
        let observed = observed.map(str::trim).filter(|v| !v.is_empty());
        self.last_observed = observed.map(str::to_string);

        self.state = if observed == Some(self.target.as_str()) {
            ConvergenceState::Converged
        } else if attempt < schedule.retries.len() {
            ConvergenceState::AwaitingConvergence(attempt + 1)
        } else {
            ConvergenceState::GaveUpConverging
        };
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            ConvergenceState::ApplyFailed
                | ConvergenceState::Converged
                | ConvergenceState::GaveUpConverging
        )
    }

    pub fn outcome(&self) -> Option<ConvergenceOutcome> {
        match self.state {
            ConvergenceState::Converged => Some(ConvergenceOutcome::Converged {
                value: self.target.clone(),
                reads: self.reads,
            }),
            ConvergenceState::GaveUpConverging => Some(ConvergenceOutcome::GaveUp {
                last_observed: self.last_observed.clone(),
                reads: self.reads,
            }),
            _ => None,
        }
    }
}

/// 按节奏驱动 [`ConvergenceTracker`]
pub struct ConvergencePoller {
    schedule: PollSchedule,
    events: EventSink,
}

impl ConvergencePoller {
    pub fn new(schedule: PollSchedule, events: EventSink) -> Self {
        Self { schedule, events }
    }

    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }

    /// 轮询直到终态或被取消
    ///
    /// `read` 读取别名当前的显示值，`sleep` 负责等待，测试中可以替换为空操作
    pub fn poll<R, S>(
        &self,
        mut tracker: ConvergenceTracker,
        cancel: &CancelToken,
        mut read: R,
        mut sleep: S,
    ) -> ConvergenceTracker
    where
        R: FnMut(&str) -> Option<String>,
        S: FnMut(Duration),
    {
        if tracker.next_delay(&self.schedule).is_none() {
            return tracker;
        }

        self.events.emit(EngineEvent::ConvergenceStarted {
            alias: tracker.alias().to_string(),
            target: tracker.target().to_string(),
        });

        while let Some(delay) = tracker.next_delay(&self.schedule) {
            if cancel.is_cancelled() {
                log::info!("设置确认已取消");
                return tracker;
            }
            sleep(delay);
            if cancel.is_cancelled() {
                log::info!("设置确认已取消");
                return tracker;
            }

            let observed = read(tracker.alias());
            log::debug!(
                "确认第 {} 次读取: {:?} (目标 {})",
                tracker.reads() + 1,
                observed,
                tracker.target()
            );
            tracker = tracker.observe(observed.as_deref(), &self.schedule);

            if let ConvergenceState::AwaitingConvergence(n) = tracker.state() {
                if n == self.schedule.retries.len() {
                    self.events
                        .emit(EngineEvent::Progress("最后一次刷新以确认设置...".to_string()));
                }
            }
        }

        if let Some(outcome) = tracker.outcome() {
            log::info!("设置确认结束: {}", outcome);
            self.events.emit(EngineEvent::ConvergenceFinished(outcome));
        }
        tracker
    }
}
