//! 后台任务向界面层发送的进度事件

use std::sync::mpsc::Sender;

use crate::core::adapter::Adapter;
use crate::core::compatibility::HealthStatus;
use crate::core::convergence::ConvergenceOutcome;
use crate::core::engine::ApplyReport;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// 一般进度文本
    Progress(String),
    /// 开始枚举适配器
    EnumerationStarted,
    /// 即将执行一批外部命令
    CommandBatch(String),
    AdaptersLoaded(Vec<Adapter>),
    EnumerationFailed(String),
    ConvergenceStarted { alias: String, target: String },
    ConvergenceFinished(ConvergenceOutcome),
    ApplyFinished(Result<ApplyReport, String>),
    HealthChecked(HealthStatus),
}

/// 可选的事件发送端，接收方已关闭时静默丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<Sender<EngineEvent>>);

impl EventSink {
    pub fn new(tx: Sender<EngineEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(ref tx) = self.0 {
            let _ = tx.send(event);
        }
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.emit(EngineEvent::Progress(message.into()));
    }

    pub fn command_batch(&self, message: impl Into<String>) {
        self.emit(EngineEvent::CommandBatch(message.into()));
    }
}
