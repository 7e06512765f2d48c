//! 适配器详细信息查询（IP / 链路速度 / 双工）
//!
//! 三个查询都以别名为键，任何失败都退化为 "Unknown"，从不返回错误

use std::sync::Arc;
use std::time::Duration;

use crate::core::adapter::{Duplex, UNKNOWN};
use crate::core::powershell::{escape_ps, CommandRunner};

#[derive(Clone)]
pub struct DetailResolver {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl DetailResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// 首个 IPv4 地址
    pub fn ip_address(&self, alias: &str) -> String {
        if alias.trim().is_empty() {
            return UNKNOWN.to_string();
        }

        let cmd = format!(
            "(Get-NetIPAddress -InterfaceAlias \"{}\" -AddressFamily IPv4 -ErrorAction SilentlyContinue | Select-Object -First 1).IPAddress",
            escape_ps(alias)
        );
        self.query(&cmd)
            .filter(|ip| ip != UNKNOWN)
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    /// 链路速度原始文本，例如 "1 Gbps"
    pub fn link_speed(&self, alias: &str) -> String {
        if alias.trim().is_empty() {
            return UNKNOWN.to_string();
        }

        let cmd = format!(
            "(Get-NetAdapter -Name \"{}\" -ErrorAction SilentlyContinue).LinkSpeed",
            escape_ps(alias)
        );
        self.query(&cmd).unwrap_or_else(|| UNKNOWN.to_string())
    }

    pub fn duplex(&self, alias: &str) -> Duplex {
        if alias.trim().is_empty() {
            return Duplex::Unknown;
        }

        let cmd = format!(
            "(Get-NetAdapter -Name \"{}\" -ErrorAction SilentlyContinue).FullDuplex",
            escape_ps(alias)
        );
        self.query(&cmd)
            .map(|raw| Duplex::from_full_duplex_flag(&raw))
            .unwrap_or_default()
    }

    /// 执行查询，取第一行非空输出
    fn query(&self, cmd: &str) -> Option<String> {
        match self.runner.run(cmd, self.timeout) {
            Ok(output) => output
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
            Err(e) => {
                log::debug!("查询适配器信息失败: {}", e);
                None
            }
        }
    }
}
