//! 日志管理模块
//!
//! 日志文件存储在 `{软件运行目录}/log`，按日期滚动；
//! 命令行模式下警告及以上级别同时输出到 stderr

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use parking_lot::RwLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use super::path::get_exe_dir;

/// 日志文件名前缀
const LOG_FILE_PREFIX: &str = "NetDuplex.log";

/// 全局日志启用状态
static LOG_ENABLED: AtomicBool = AtomicBool::new(true);

/// 全局日志守卫（保持文件写入器存活）
static LOG_GUARD: OnceLock<RwLock<Option<WorkerGuard>>> = OnceLock::new();

/// 日志管理器
pub struct LogManager;

impl LogManager {
    /// 获取日志目录路径
    pub fn get_log_dir() -> PathBuf {
        get_exe_dir().join("log")
    }

    /// 初始化日志系统
    ///
    /// `enabled` 为 false 时安装一个全部过滤掉的空订阅器，
    /// 这样 `log` 宏的调用仍然安全
    pub fn init(enabled: bool) -> anyhow::Result<()> {
        LOG_ENABLED.store(enabled, Ordering::SeqCst);

        if !enabled {
            let noop_layer = fmt::layer()
                .with_writer(std::io::sink)
                .with_filter(EnvFilter::new("off"));

            tracing_subscriber::registry().with(noop_layer).try_init()?;
            return Ok(());
        }

        let log_dir = Self::get_log_dir();
        std::fs::create_dir_all(&log_dir)?;

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(env_filter);

        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .with_filter(EnvFilter::new("warn"));

        tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer)
            .try_init()?;

        let lock = LOG_GUARD.get_or_init(|| RwLock::new(None));
        *lock.write() = Some(guard);

        log::info!("日志系统初始化完成，日志目录: {}", log_dir.display());
        Ok(())
    }

    /// 检查日志是否启用
    pub fn is_enabled() -> bool {
        LOG_ENABLED.load(Ordering::SeqCst)
    }

    /// 获取当天的日志文件路径
    pub fn get_current_log_file() -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        Self::get_log_dir().join(format!("{}.{}", LOG_FILE_PREFIX, today))
    }

    /// 删除 `days` 天之前的日志文件，返回删除的文件数
    pub fn cleanup_old_logs(days: u32) -> anyhow::Result<usize> {
        let log_dir = Self::get_log_dir();
        if !log_dir.exists() {
            return Ok(0);
        }

        let cutoff = chrono::Local::now() - chrono::Duration::days(days as i64);
        let mut removed = 0;

        for entry in std::fs::read_dir(&log_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }

            let modified = match path.metadata().and_then(|m| m.modified()) {
                Ok(modified) => chrono::DateTime::<chrono::Local>::from(modified),
                Err(_) => continue,
            };

            if modified < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        removed += 1;
                        log::info!("已删除旧日志文件: {}", path.display());
                    }
                    Err(e) => log::warn!("删除旧日志文件失败: {} - {}", path.display(), e),
                }
            }
        }

        Ok(removed)
    }
}
