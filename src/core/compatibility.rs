//! 系统兼容性检查
//!
//! 启动时的健康检查只关心 WMI / PowerShell / 管理员权限三项；
//! 完整报告额外探测 netsh、wmic 与 WMI 服务状态，并给出处理建议。

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::core::adapter::UNKNOWN;
use crate::core::connection::{ConnectionManager, SessionFactory};
use crate::core::error::Result;
use crate::core::powershell::CommandRunner;
use crate::utils::cmd::{create_command, run_with_timeout, TimedOutput};
use crate::utils::encoding::decode_console_output;

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(8);

/// 检查 WMI 会话能否建立
pub trait SessionProbe: Send + Sync {
    fn ensure_session(&self) -> Result<()>;
}

impl<F: SessionFactory> SessionProbe for ConnectionManager<F> {
    fn ensure_session(&self) -> Result<()> {
        self.ensure_ready()
    }
}

/// 运行非 PowerShell 的外部工具
pub trait ToolProbe: Send + Sync {
    /// 返回 (是否成功退出, 标准输出)；无法启动或超时返回 None
    fn probe(&self, program: &str, args: &[&str], timeout: Duration) -> Option<(bool, String)>;
}

/// 直接启动子进程的探测器
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProbe;

impl ToolProbe for ProcessProbe {
    fn probe(&self, program: &str, args: &[&str], timeout: Duration) -> Option<(bool, String)> {
        let mut cmd = create_command(program);
        cmd.args(args);
        match run_with_timeout(cmd, timeout) {
            Ok(TimedOutput::Finished(output)) => Some((
                output.status.success(),
                decode_console_output(&output.stdout),
            )),
            Ok(TimedOutput::TimedOut) => {
                log::debug!("{} 探测超时", program);
                None
            }
            Err(e) => {
                log::debug!("{} 无法启动: {}", program, e);
                None
            }
        }
    }
}

/// 启动健康检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub wmi_available: bool,
    pub powershell_available: bool,
    pub admin_rights: bool,
}

impl HealthStatus {
    /// 无法继续运行时的提示；权限不足不算失败
    pub fn failure_message(&self) -> Option<&'static str> {
        if !self.wmi_available {
            Some("WMI服务不可用，请检查系统配置")
        } else if !self.powershell_available {
            Some("PowerShell不可用，请检查系统配置")
        } else {
            None
        }
    }
}

/// 启动健康检查
pub fn check_health(runner: &dyn CommandRunner, session: &dyn SessionProbe, is_admin: bool) -> HealthStatus {
    let wmi_available = match session.ensure_session() {
        Ok(()) => true,
        Err(e) => {
            log::warn!("WMI检查失败: {}", e);
            false
        }
    };

    let powershell_available = match runner.run("echo \"test\"", HEALTH_PROBE_TIMEOUT) {
        Ok(_) => true,
        Err(e) => {
            log::warn!("PowerShell检查失败: {}", e);
            false
        }
    };

    HealthStatus {
        wmi_available,
        powershell_available,
        admin_rights: is_admin,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInfo {
    pub os: String,
    pub family: String,
    pub arch: String,
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowerShellInfo {
    pub available: bool,
    pub path: Option<String>,
    pub version: String,
    pub execution_policy: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WmiInfo {
    pub available: bool,
    pub service_running: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkCommandsInfo {
    pub netsh_available: bool,
    pub get_netadapter_available: bool,
    pub wmic_available: bool,
}

/// 兼容性报告（按需生成，不持久化）
#[derive(Debug, Clone, Serialize)]
pub struct CompatibilityReport {
    pub generated_at: String,
    pub system: SystemInfo,
    pub powershell: PowerShellInfo,
    pub wmi: WmiInfo,
    pub network_commands: NetworkCommandsInfo,
    pub recommendations: Vec<String>,
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "是"
    } else {
        "否"
    }
}

fn availability(flag: bool) -> &'static str {
    if flag {
        "可用"
    } else {
        "不可用"
    }
}

impl CompatibilityReport {
    /// 纯文本摘要
    pub fn to_formatted_text(&self) -> String {
        let separator = "=".repeat(60);
        let mut lines = vec![
            separator.clone(),
            "系统兼容性检查报告".to_string(),
            separator.clone(),
            String::new(),
            "系统信息:".to_string(),
            format!("  平台: {} ({}, {})", self.system.os, self.system.family, self.system.arch),
            format!("  管理员权限: {}", yes_no(self.system.is_admin)),
            format!("  生成时间: {}", self.generated_at),
            String::new(),
            "PowerShell兼容性:".to_string(),
            format!("  可用性: {}", yes_no(self.powershell.available)),
        ];

        if self.powershell.available {
            lines.push(format!(
                "  路径: {}",
                self.powershell.path.as_deref().unwrap_or(UNKNOWN)
            ));
            lines.push(format!("  版本: {}", self.powershell.version));
            lines.push(format!("  执行策略: {}", self.powershell.execution_policy));
        }

        lines.push(String::new());
        lines.push("WMI兼容性:".to_string());
        lines.push(format!("  可用性: {}", yes_no(self.wmi.available)));
        lines.push(format!("  服务运行: {}", yes_no(self.wmi.service_running)));
        if let Some(ref error) = self.wmi.error {
            lines.push(format!("  错误: {}", error));
        }

        let net = &self.network_commands;
        lines.push(String::new());
        lines.push("网络命令兼容性:".to_string());
        lines.push(format!("  netsh: {}", availability(net.netsh_available)));
        lines.push(format!("  Get-NetAdapter: {}", availability(net.get_netadapter_available)));
        lines.push(format!("  wmic: {}", availability(net.wmic_available)));

        if !self.recommendations.is_empty() {
            lines.push(String::new());
            lines.push("建议:".to_string());
            for (i, rec) in self.recommendations.iter().enumerate() {
                lines.push(format!("  {}. {}", i + 1, rec));
            }
        }

        lines.push(separator);
        lines.join("\n")
    }
}

/// 根据检查结果生成处理建议
pub fn build_recommendations(
    powershell: &PowerShellInfo,
    wmi: &WmiInfo,
    network: &NetworkCommandsInfo,
    is_admin: bool,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if !powershell.available {
        recommendations.push("PowerShell不可用，请检查系统配置或安装PowerShell".to_string());
    } else if powershell.execution_policy.eq_ignore_ascii_case("Restricted") {
        recommendations.push("PowerShell执行策略受限，建议设置为RemoteSigned或Bypass".to_string());
    }

    if !wmi.available {
        if !wmi.service_running {
            recommendations
                .push("WMI服务未运行，请启动Windows Management Instrumentation服务".to_string());
        } else {
            recommendations.push("WMI不可用，请检查COM组件与WMI仓库是否完好".to_string());
        }
    }

    if !network.get_netadapter_available {
        recommendations
            .push("Get-NetAdapter命令不可用，可能需要更新PowerShell或Windows版本".to_string());
    }

    if !is_admin {
        recommendations.push("当前未以管理员身份运行，某些功能可能受限".to_string());
    }

    recommendations
}

/// 兼容性检查器
pub struct CompatibilityChecker {
    runner: Arc<dyn CommandRunner>,
    session: Arc<dyn SessionProbe>,
    tools: Arc<dyn ToolProbe>,
    is_admin: bool,
    /// 报告中 PowerShell 查询的超时
    query_timeout: Duration,
}

impl CompatibilityChecker {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        session: Arc<dyn SessionProbe>,
        tools: Arc<dyn ToolProbe>,
        is_admin: bool,
    ) -> Self {
        Self {
            runner,
            session,
            tools,
            is_admin,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn health_check(&self) -> HealthStatus {
        check_health(self.runner.as_ref(), self.session.as_ref(), self.is_admin)
    }

    pub fn report(&self) -> CompatibilityReport {
        log::info!("开始系统兼容性检查");

        let system = SystemInfo {
            os: std::env::consts::OS.to_string(),
            family: std::env::consts::FAMILY.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            is_admin: self.is_admin,
        };
        let powershell = self.check_powershell();
        let wmi = self.check_wmi();
        let network_commands = self.check_network_commands();
        let recommendations =
            build_recommendations(&powershell, &wmi, &network_commands, self.is_admin);

        CompatibilityReport {
            generated_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            system,
            powershell,
            wmi,
            network_commands,
            recommendations,
        }
    }

    fn check_powershell(&self) -> PowerShellInfo {
        let mut info = PowerShellInfo {
            available: false,
            path: None,
            version: UNKNOWN.to_string(),
            execution_policy: UNKNOWN.to_string(),
        };

        match self.runner.run_traced("echo \"test\"", self.query_timeout) {
            Ok(output) => {
                info.available = true;
                info.path = Some(output.interpreter);
            }
            Err(e) => {
                log::warn!("PowerShell不可用: {}", e);
                return info;
            }
        }

        if let Some(version) = self.first_line("$PSVersionTable.PSVersion.ToString()") {
            info.version = version;
        }
        if let Some(policy) = self.first_line("Get-ExecutionPolicy") {
            info.execution_policy = policy;
        }
        info
    }

    fn first_line(&self, script: &str) -> Option<String> {
        self.runner
            .run(script, self.query_timeout)
            .ok()?
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }

    fn check_wmi(&self) -> WmiInfo {
        let service_running = self
            .tools
            .probe("sc", &["query", "winmgmt"], PROBE_TIMEOUT)
            .map(|(ok, stdout)| ok && stdout.contains("RUNNING"))
            .unwrap_or(false);

        let (available, error) = match self.session.ensure_session() {
            Ok(()) => (true, None),
            Err(e) => (false, Some(format!("WMI连接失败: {}", e))),
        };

        WmiInfo {
            available,
            service_running,
            error,
        }
    }

    fn check_network_commands(&self) -> NetworkCommandsInfo {
        let tool_ok = |program: &str, args: &[&str]| {
            self.tools
                .probe(program, args, PROBE_TIMEOUT)
                .map(|(ok, _)| ok)
                .unwrap_or(false)
        };

        NetworkCommandsInfo {
            netsh_available: tool_ok("netsh", &["interface", "show", "interface"]),
            get_netadapter_available: self
                .runner
                .run("Get-NetAdapter | Select-Object -First 1", self.query_timeout)
                .is_ok(),
            wmic_available: tool_ok(
                "wmic",
                &["path", "win32_networkadapter", "get", "name", "/format:list"],
            ),
        }
    }
}
