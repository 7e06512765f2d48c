//! WMI 会话生命周期管理
//!
//! 会话懒创建、互斥锁保护、可强制重连。创建会话的线程和使用会话的线程
//! 都必须先向 COM 子系统注册（见 [`ThreadRegistration`]）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::error::{EngineError, Result};

/// 会话工厂：负责线程注册与会话创建
pub trait SessionFactory: Send + Sync + 'static {
    type Session: Send + Sync + 'static;

    /// 把当前线程注册到组件子系统
    ///
    /// 已注册时直接返回 false，不视为错误；返回 true 表示需要配对注销
    fn register_thread(&self) -> bool {
        false
    }

    /// 注销当前线程，失败时静默忽略
    fn unregister_thread(&self) {}

    /// 创建新会话
    fn open(&self) -> Result<Self::Session>;
}

/// 线程注册守卫，离开作用域时注销
pub struct ThreadRegistration<F: SessionFactory> {
    factory: Arc<F>,
    registered: bool,
}

impl<F: SessionFactory> ThreadRegistration<F> {
    pub fn new(factory: Arc<F>) -> Self {
        let registered = factory.register_thread();
        Self {
            factory,
            registered,
        }
    }
}

impl<F: SessionFactory> Drop for ThreadRegistration<F> {
    fn drop(&mut self) {
        if self.registered {
            self.factory.unregister_thread();
        }
    }
}

/// 连接参数
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    /// 单次建立连接的超时
    pub timeout: Duration,
    /// 最大尝试次数
    pub max_retries: u32,
    /// 两次尝试之间的等待
    pub backoff: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 2,
            backoff: Duration::from_secs(1),
        }
    }
}

/// 会话状态
enum SessionState<S> {
    Uninitialized,
    Initializing,
    Ready(S),
}

/// 连接状态（对外只读）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Uninitialized,
    Initializing,
    Ready,
}

/// WMI 连接管理器
pub struct ConnectionManager<F: SessionFactory> {
    factory: Arc<F>,
    state: Mutex<SessionState<F::Session>>,
    /// 锁外快速检查用
    ready: AtomicBool,
    options: ConnectionOptions,
}

impl<F: SessionFactory> ConnectionManager<F> {
    pub fn new(factory: F, options: ConnectionOptions) -> Self {
        Self {
            factory: Arc::new(factory),
            state: Mutex::new(SessionState::Uninitialized),
            ready: AtomicBool::new(false),
            options,
        }
    }

    pub fn factory(&self) -> Arc<F> {
        Arc::clone(&self.factory)
    }

    pub fn phase(&self) -> ConnectionPhase {
        match &*self.state.lock() {
            SessionState::Uninitialized => ConnectionPhase::Uninitialized,
            SessionState::Initializing => ConnectionPhase::Initializing,
            SessionState::Ready(_) => ConnectionPhase::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// 确保会话可用（幂等）
    pub fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut state = self.state.lock();
        if matches!(*state, SessionState::Ready(_)) {
            return Ok(());
        }

        *state = SessionState::Initializing;
        let _registration = ThreadRegistration::new(self.factory());

        let mut last_error: Option<EngineError> = None;
        for attempt in 1..=self.options.max_retries {
            match self.open_with_timeout() {
                Ok(session) => {
                    *state = SessionState::Ready(session);
                    self.ready.store(true, Ordering::Release);
                    log::info!("WMI连接建立成功（第 {} 次尝试）", attempt);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("WMI连接第 {} 次尝试失败: {}", attempt, e);
                    last_error = Some(e);
                    if attempt < self.options.max_retries {
                        std::thread::sleep(self.options.backoff);
                    }
                }
            }
        }

        *state = SessionState::Uninitialized;
        Err(EngineError::ConnectionFailed {
            attempts: self.options.max_retries,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "未进行任何尝试".to_string()),
        })
    }

    /// 在独立线程中创建会话，超时后放弃等待
    fn open_with_timeout(&self) -> Result<F::Session> {
        let (tx, rx) = mpsc::channel();
        let factory = Arc::clone(&self.factory);

        std::thread::Builder::new()
            .name("wmi-connect".to_string())
            .spawn(move || {
                let _registration = ThreadRegistration::new(Arc::clone(&factory));
                let _ = tx.send(factory.open());
            })?;

        match rx.recv_timeout(self.options.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::ConnectionTimeout(self.options.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::ConnectionFailed {
                attempts: 1,
                reason: "连接线程意外退出".to_string(),
            }),
        }
    }

    /// 丢弃当前会话并重新建立
    pub fn reconnect(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            *state = SessionState::Uninitialized;
            self.ready.store(false, Ordering::Release);
        }
        log::info!("重新连接WMI");
        self.ensure_ready()
    }

    /// 释放会话并注销当前线程
    ///
    /// 注销对未注册的线程无效，调用方持有的 [`ThreadRegistration`] 随后析构也不会重复注销
    pub fn dispose(&self) {
        {
            let mut state = self.state.lock();
            *state = SessionState::Uninitialized;
            self.ready.store(false, Ordering::Release);
        }
        self.factory.unregister_thread();
    }

    /// 在锁内使用会话
    pub fn with_session<R>(&self, f: impl FnOnce(&F::Session) -> Result<R>) -> Result<R> {
        let _registration = ThreadRegistration::new(self.factory());
        self.ensure_ready()?;

        let state = self.state.lock();
        match &*state {
            SessionState::Ready(session) => f(session),
            _ => Err(EngineError::ConnectionFailed {
                attempts: 0,
                reason: "会话已被释放".to_string(),
            }),
        }
    }
}
