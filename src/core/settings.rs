//! 写入“速度和双工”高级属性、重启适配器

use std::sync::Arc;
use std::time::Duration;

use crate::core::error::{EngineError, RestartPhase, Result};
use crate::core::events::EventSink;
use crate::core::powershell::{escape_ps, CommandRunner};

const ADMIN_REQUIRED: &str = "需要管理员权限才能修改网络设置";

pub struct SettingsApplier {
    runner: Arc<dyn CommandRunner>,
    is_admin: bool,
    timeout: Duration,
    events: EventSink,
}

impl SettingsApplier {
    /// `is_admin` 在构造时确定，之后不再查询
    pub fn new(runner: Arc<dyn CommandRunner>, is_admin: bool, timeout: Duration) -> Self {
        Self {
            runner,
            is_admin,
            timeout,
            events: EventSink::none(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    /// 设置适配器的速度/双工模式，成功时返回提示文本
    pub fn apply(&self, alias: &str, value: &str) -> Result<String> {
        if !self.is_admin {
            return Err(EngineError::PrivilegeDenied(ADMIN_REQUIRED.to_string()));
        }

        let alias = alias.trim();
        let value = value.trim();
        if alias.is_empty() {
            return Err(EngineError::InvalidArgument("适配器名称不能为空".to_string()));
        }
        if value.is_empty() {
            return Err(EngineError::InvalidArgument("速度/双工值不能为空".to_string()));
        }

        let name = escape_ps(alias);
        let display_value = escape_ps(value);
        let commands = [
            format!(
                "Set-NetAdapterAdvancedProperty -Name \"{}\" -RegistryKeyword \"*SpeedDuplex\" -DisplayValue \"{}\"",
                name, display_value
            ),
            format!(
                "Set-NetAdapterAdvancedProperty -Name \"{}\" -DisplayName \"*Speed*Duplex*\" -DisplayValue \"{}\"",
                name, display_value
            ),
        ];

        self.events
            .command_batch(format!("正在设置 {} 为 {}...", alias, value));

        let mut last_error = String::new();
        for command in &commands {
            match self.runner.run(command, self.timeout) {
                Ok(_) => {
                    log::info!("已设置 {} 的速度/双工为 {}", alias, value);
                    return Ok(format!("成功设置 {} 的网络设置为 {}", alias, value));
                }
                Err(e) => {
                    log::debug!("设置命令失败: {}", e);
                    last_error = e.to_string();
                }
            }
        }

        log::warn!("设置 {} 失败: {}", alias, last_error);
        Err(EngineError::ApplyFailed {
            message: last_error,
            hint: self.diagnostic_hint(&name),
        })
    }

    /// 列出名称中带 Speed/Duplex 的高级属性，失败时返回 None
    fn diagnostic_hint(&self, escaped_alias: &str) -> Option<String> {
        let cmd = format!(
            "Get-NetAdapterAdvancedProperty -Name \"{}\" | \
             Where-Object {{$_.RegistryKeyword -like \"*Speed*\" -or $_.DisplayName -like \"*Duplex*\" -or $_.DisplayName -like \"*Speed*\"}} | \
             Select-Object -Property DisplayName, RegistryKeyword, DisplayValue | Format-Table -AutoSize",
            escaped_alias
        );

        match self.runner.run(&cmd, self.timeout) {
            Ok(output) if !output.trim().is_empty() => Some(output),
            Ok(_) => None,
            Err(e) => {
                log::debug!("获取高级属性列表失败: {}", e);
                None
            }
        }
    }

    /// 禁用后重新启用适配器
    ///
    /// 禁用成功但启用失败时返回 [`EngineError::RestartPartialFailure`]，
    /// 此时适配器处于禁用状态，不会自动重试
    pub fn restart_adapter(&self, alias: &str) -> Result<String> {
        if !self.is_admin {
            return Err(EngineError::PrivilegeDenied(ADMIN_REQUIRED.to_string()));
        }
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(EngineError::InvalidArgument("适配器名称不能为空".to_string()));
        }
        let name = escape_ps(alias);

        self.events.command_batch(format!("正在禁用 {}...", alias));
        self.runner
            .run(
                &format!("Disable-NetAdapter -Name \"{}\" -Confirm:$false", name),
                self.timeout,
            )
            .map_err(|e| EngineError::RestartFailed {
                phase: RestartPhase::Disable,
                message: e.to_string(),
            })?;

        self.events.command_batch(format!("正在启用 {}...", alias));
        self.runner
            .run(
                &format!("Enable-NetAdapter -Name \"{}\" -Confirm:$false", name),
                self.timeout,
            )
            .map_err(|e| {
                log::error!("适配器 {} 已禁用但重新启用失败: {}", alias, e);
                EngineError::RestartPartialFailure {
                    alias: alias.to_string(),
                    message: e.to_string(),
                }
            })?;

        log::info!("适配器 {} 已重启", alias);
        Ok(format!("适配器 {} 已重启", alias))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{Reply, ScriptedRunner};

    fn applier(runner: ScriptedRunner, is_admin: bool) -> (SettingsApplier, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (
            SettingsApplier::new(runner.clone(), is_admin, Duration::from_secs(15)),
            runner,
        )
    }

    #[test]
    fn test_requires_admin_and_runs_nothing() {
        let (applier, runner) = applier(ScriptedRunner::new(), false);
        let err = applier.apply("以太网", "1.0 Gbps 全双工").unwrap_err();
        assert!(err.needs_elevation());
        assert!(err.to_string().contains("管理员权限"));
        assert_eq!(runner.call_count(), 0);

        assert!(applier.restart_adapter("以太网").unwrap_err().needs_elevation());
        assert_eq!(runner.call_count(), 0);
    }

    #[test]
    fn test_blank_arguments_run_nothing() {
        let (applier, runner) = applier(ScriptedRunner::new(), true);
        assert!(matches!(
            applier.apply("  ", "1.0 Gbps 全双工"),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            applier.apply("以太网", "\t"),
            Err(EngineError::InvalidArgument(_))
        ));
        assert_eq!(runner.call_count(), 0);
    }

    #[test]
    fn test_keyword_selector_success_is_single_command() {
        let (applier, runner) =
            applier(ScriptedRunner::new().on("Set-NetAdapterAdvancedProperty", Reply::ok("")), true);
        let message = applier.apply("以太网", "1.0 Gbps 全双工").unwrap();
        assert_eq!(message, "成功设置 以太网 的网络设置为 1.0 Gbps 全双工");
        assert_eq!(runner.call_count(), 1);
        assert!(runner.calls()[0].contains("-RegistryKeyword \"*SpeedDuplex\""));
    }

    #[test]
    fn test_display_name_selector_fallback() {
        let (applier, runner) = applier(
            ScriptedRunner::new()
                .on("-RegistryKeyword", Reply::fail("No matching keyword value found"))
                .on("-DisplayName", Reply::ok("")),
            true,
        );
        assert!(applier.apply("以太网", "100 Mbps 全双工").is_ok());
        assert_eq!(runner.call_count(), 2);
    }

    #[test]
    fn test_failure_carries_hint() {
        let (applier, runner) = applier(
            ScriptedRunner::new()
                .on("Set-NetAdapterAdvancedProperty", Reply::fail("No matching keyword value found"))
                .on(
                    "Format-Table",
                    Reply::ok("DisplayName     RegistryKeyword DisplayValue\nSpeed & Duplex  *SpeedDuplex    Auto Negotiation"),
                ),
            true,
        );
        let err = applier.apply("以太网", "2.5 Gbps 全双工").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("No matching keyword value found"));
        assert!(text.contains("供排查"));
        assert!(text.contains("Auto Negotiation"));
        assert_eq!(runner.call_count(), 3);
    }

    #[test]
    fn test_hint_failure_does_not_change_outcome() {
        let (applier, _) = applier(
            ScriptedRunner::new()
                .on("Set-NetAdapterAdvancedProperty", Reply::fail("拒绝访问"))
                .on("Format-Table", Reply::Timeout),
            true,
        );
        match applier.apply("以太网", "100 Mbps 全双工") {
            Err(EngineError::ApplyFailed { message, hint }) => {
                assert!(message.contains("拒绝访问"));
                assert_eq!(hint, None);
            }
            other => panic!("意外的结果: {:?}", other),
        }
    }

    #[test]
    fn test_values_are_escaped() {
        let (applier, runner) =
            applier(ScriptedRunner::new().on("Set-NetAdapterAdvancedProperty", Reply::ok("")), true);
        applier.apply(r#"Lab "A""#, "1.0 Gbps").unwrap();
        assert!(runner.calls()[0].contains(r#"-Name "Lab `"A`"""#));
    }

    #[test]
    fn test_restart_success() {
        let (applier, runner) = applier(
            ScriptedRunner::new()
                .on("Disable-NetAdapter", Reply::ok(""))
                .on("Enable-NetAdapter", Reply::ok("")),
            true,
        );
        assert!(applier.restart_adapter("以太网").is_ok());
        assert_eq!(runner.call_count(), 2);
        assert!(runner.calls()[0].contains("-Confirm:$false"));
    }

    #[test]
    fn test_restart_disable_failure() {
        let (applier, runner) =
            applier(ScriptedRunner::new().on("Disable-NetAdapter", Reply::fail("拒绝访问")), true);
        match applier.restart_adapter("以太网") {
            Err(EngineError::RestartFailed { phase, .. }) => assert_eq!(phase, RestartPhase::Disable),
            other => panic!("意外的结果: {:?}", other),
        }
        assert_eq!(runner.count_matching("Enable-NetAdapter"), 0);
    }

    #[test]
    fn test_restart_partial_failure() {
        let (applier, runner) = applier(
            ScriptedRunner::new()
                .on("Disable-NetAdapter", Reply::ok(""))
                .on("Enable-NetAdapter", Reply::fail("设备未响应")),
            true,
        );
        let err = applier.restart_adapter("以太网").unwrap_err();
        assert!(matches!(err, EngineError::RestartPartialFailure { .. }));
        assert!(err.leaves_adapter_down());
        let text = err.to_string();
        assert!(text.contains("已禁用"));
        assert!(text.contains("重新启用失败"));
        assert_eq!(runner.count_matching("Enable-NetAdapter"), 1);
    }
}
