//! 引擎错误类型
//!
//! 底层的工具/超时/解析错误会在有兜底策略的地方被吸收，
//! 只有兜底链全部失败时才会以这里的错误形式交给调用方

use std::time::Duration;

/// 适配器重启的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPhase {
    Disable,
    Enable,
}

impl std::fmt::Display for RestartPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartPhase::Disable => write!(f, "禁用"),
            RestartPhase::Enable => write!(f, "启用"),
        }
    }
}

/// 引擎错误
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("未找到可用的{0}")]
    ToolUnavailable(String),

    #[error("命令执行超时 ({0:?})")]
    Timeout(Duration),

    #[error("命令执行失败: {0}")]
    NonZeroExit(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("输出解析失败: {0}")]
    ParseFailure(String),

    #[error("WMI连接超时 ({0:?})")]
    ConnectionTimeout(Duration),

    #[error("WMI连接失败，已重试{attempts}次: {reason}")]
    ConnectionFailed { attempts: u32, reason: String },

    #[error("获取网络适配器失败: {0}")]
    EnumerationFailed(String),

    #[error("{0}")]
    PrivilegeDenied(String),

    #[error("参数无效: {0}")]
    InvalidArgument(String),

    #[error("设置失败: {message}{}", format_hint(.hint))]
    ApplyFailed {
        message: String,
        hint: Option<String>,
    },

    #[error("{phase}适配器失败: {message}")]
    RestartFailed { phase: RestartPhase, message: String },

    #[error("适配器 {alias} 已禁用，但重新启用失败: {message}（适配器当前处于禁用状态）")]
    RestartPartialFailure { alias: String, message: String },

    #[error("当前平台不支持: {0}")]
    Unsupported(String),

    #[error("已有{0}任务在运行")]
    Busy(String),

    #[error("操作已取消")]
    Cancelled,
}

fn format_hint(hint: &Option<String>) -> String {
    match hint {
        Some(hint) if !hint.trim().is_empty() => {
            format!("\n\n可用的相关高级属性如下(供排查):\n{}", hint.trim())
        }
        _ => String::new(),
    }
}

impl EngineError {
    /// 是否需要调用方提示用户以管理员身份运行
    pub fn needs_elevation(&self) -> bool {
        matches!(self, EngineError::PrivilegeDenied(_))
    }

    /// 适配器是否可能停留在禁用状态
    pub fn leaves_adapter_down(&self) -> bool {
        matches!(self, EngineError::RestartPartialFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
