//! 引擎配置
//! 管理程序目录下的 config.json，缺失的字段使用默认值

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::connection::ConnectionOptions;
use crate::core::convergence::PollSchedule;
use crate::utils::path::get_exe_dir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 一般 PowerShell 命令超时（秒）
    #[serde(default = "default_powershell_timeout")]
    pub powershell_timeout_secs: u64,

    /// Get-NetAdapter 列表命令超时（秒）
    #[serde(default = "default_enumeration_timeout")]
    pub enumeration_timeout_secs: u64,

    /// IP/速度/双工查询超时（秒）
    #[serde(default = "default_detail_timeout")]
    pub detail_timeout_secs: u64,

    /// 可选值/当前值查询超时（秒）
    #[serde(default = "default_options_timeout")]
    pub options_timeout_secs: u64,

    /// 设置与重启命令超时（秒）
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,

    /// WMI 连接超时（秒）
    #[serde(default = "default_wmi_timeout")]
    pub wmi_timeout_secs: u64,

    /// WMI 连接最大尝试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// 兜底枚举的线程池大小
    #[serde(default = "default_thread_pool_size")]
    pub thread_pool_size: usize,

    #[serde(default = "default_detail_item_timeout")]
    pub detail_item_timeout_secs: u64,

    /// 设置成功后首次确认前的等待（毫秒）
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// 之后每次确认前的等待（毫秒）
    #[serde(default = "default_convergence_delays")]
    pub convergence_delays_ms: Vec<u64>,

    /// 停止后台任务时的等待上限（毫秒）
    #[serde(default = "default_worker_grace")]
    pub worker_grace_ms: u64,

    /// 刷新失败后自动重试前的等待（毫秒）
    #[serde(default = "default_refresh_retry_delay")]
    pub refresh_retry_delay_ms: u64,

    /// 只显示有线网卡
    #[serde(default)]
    pub exclude_wireless: bool,

    /// 是否启用日志记录（默认启用）
    #[serde(default = "default_log_enabled")]
    pub log_enabled: bool,

    /// 日志保留天数（默认7天）
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u32,
}

fn default_powershell_timeout() -> u64 {
    8
}

fn default_enumeration_timeout() -> u64 {
    6
}

fn default_detail_timeout() -> u64 {
    5
}

fn default_options_timeout() -> u64 {
    6
}

fn default_apply_timeout() -> u64 {
    15
}

fn default_wmi_timeout() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff() -> u64 {
    1000
}

fn default_thread_pool_size() -> usize {
    4
}

fn default_detail_item_timeout() -> u64 {
    10
}

fn default_settle_delay() -> u64 {
    2000
}

fn default_convergence_delays() -> Vec<u64> {
    vec![800, 1500]
}

fn default_worker_grace() -> u64 {
    3000
}

fn default_refresh_retry_delay() -> u64 {
    800
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_retention_days() -> u32 {
    7
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            powershell_timeout_secs: default_powershell_timeout(),
            enumeration_timeout_secs: default_enumeration_timeout(),
            detail_timeout_secs: default_detail_timeout(),
            options_timeout_secs: default_options_timeout(),
            apply_timeout_secs: default_apply_timeout(),
            wmi_timeout_secs: default_wmi_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
            thread_pool_size: default_thread_pool_size(),
            detail_item_timeout_secs: default_detail_item_timeout(),
            settle_delay_ms: default_settle_delay(),
            convergence_delays_ms: default_convergence_delays(),
            worker_grace_ms: default_worker_grace(),
            refresh_retry_delay_ms: default_refresh_retry_delay(),
            exclude_wireless: false,
            log_enabled: default_log_enabled(),
            log_retention_days: default_log_retention_days(),
        }
    }
}

impl EngineConfig {
    fn get_config_path() -> PathBuf {
        get_exe_dir().join("config.json")
    }

    /// 从程序目录加载配置
    ///
    /// 可能在日志初始化之前调用，失败时静默返回默认配置
    pub fn load() -> Self {
        Self::load_from(&Self::get_config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<EngineConfig>(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        log::info!("配置文件已保存");
        Ok(())
    }

    pub fn powershell_timeout(&self) -> Duration {
        Duration::from_secs(self.powershell_timeout_secs)
    }

    pub fn enumeration_timeout(&self) -> Duration {
        Duration::from_secs(self.enumeration_timeout_secs)
    }

    pub fn detail_timeout(&self) -> Duration {
        Duration::from_secs(self.detail_timeout_secs)
    }

    pub fn options_timeout(&self) -> Duration {
        Duration::from_secs(self.options_timeout_secs)
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn detail_item_timeout(&self) -> Duration {
        Duration::from_secs(self.detail_item_timeout_secs)
    }

    pub fn worker_grace(&self) -> Duration {
        Duration::from_millis(self.worker_grace_ms)
    }

    pub fn refresh_retry_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_delay_ms)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            timeout: Duration::from_secs(self.wmi_timeout_secs),
            max_retries: self.max_retries.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            settle: Duration::from_millis(self.settle_delay_ms),
            retries: self
                .convergence_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("netduplex-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.enumeration_timeout(), Duration::from_secs(6));
        assert_eq!(config.connection_options().max_retries, 2);
        assert_eq!(config.poll_schedule(), PollSchedule::default());
        assert!(!config.exclude_wireless);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let path = temp_path("partial.json");
        std::fs::write(&path, r#"{"exclude_wireless": true, "settle_delay_ms": 1000}"#).unwrap();

        let config = EngineConfig::load_from(&path);
        assert!(config.exclude_wireless);
        assert_eq!(config.settle_delay_ms, 1000);
        assert_eq!(config.convergence_delays_ms, vec![800, 1500]);
        assert_eq!(config.apply_timeout_secs, 15);
    }

    #[test]
    fn test_missing_or_malformed_file_uses_defaults() {
        assert_eq!(
            EngineConfig::load_from(&temp_path("missing.json")),
            EngineConfig::default()
        );

        let path = temp_path("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(EngineConfig::load_from(&path), EngineConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let path = temp_path("saved.json");
        let config = EngineConfig {
            thread_pool_size: 2,
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(EngineConfig::load_from(&path), config);
    }

    #[test]
    fn test_zero_retries_still_connects_once() {
        let config = EngineConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert_eq!(config.connection_options().max_retries, 1);
    }
}
