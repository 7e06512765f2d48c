//! “速度和双工”可选值查询

use std::sync::Arc;
use std::time::Duration;

use crate::core::error::Result;
use crate::core::powershell::{escape_ps, non_blank_lines, CommandRunner};

/// 无法从系统获取可选值时使用的默认列表
pub const DEFAULT_OPTIONS: [&str; 6] = [
    "自动侦测",
    "10 Mbps 半双工",
    "10 Mbps 全双工",
    "100 Mbps 半双工",
    "100 Mbps 全双工",
    "1.0 Gbps 全双工",
];

pub fn default_options() -> Vec<String> {
    DEFAULT_OPTIONS.iter().map(|s| s.to_string()).collect()
}

/// 高级属性的两种定位方式，先按注册表关键字，再按显示名通配
fn selectors(alias: &str) -> [String; 2] {
    let alias = escape_ps(alias);
    [
        format!(
            "Get-NetAdapterAdvancedProperty -Name \"{}\" -RegistryKeyword \"*SpeedDuplex\" -ErrorAction SilentlyContinue",
            alias
        ),
        format!(
            "Get-NetAdapterAdvancedProperty -Name \"{}\" -DisplayName \"*Speed*Duplex*\" -ErrorAction SilentlyContinue",
            alias
        ),
    ]
}

pub struct OptionResolver {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl OptionResolver {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// 获取适配器支持的速度/双工显示值，保持系统给出的顺序
    ///
    /// 查询失败或为空时：`allow_fallback` 为 true 返回默认列表，否则返回空列表
    pub fn get_options(&self, alias: &str, allow_fallback: bool) -> Vec<String> {
        match self.query_options(alias) {
            Ok(options) if !options.is_empty() => options,
            Ok(_) => {
                log::warn!("适配器 {} 未报告可选的速度/双工值", alias);
                self.fallback(allow_fallback)
            }
            Err(e) => {
                log::warn!("获取适配器 {} 的速度/双工选项失败: {}", alias, e);
                self.fallback(allow_fallback)
            }
        }
    }

    fn fallback(&self, allow_fallback: bool) -> Vec<String> {
        if allow_fallback {
            default_options()
        } else {
            Vec::new()
        }
    }

    fn query_options(&self, alias: &str) -> Result<Vec<String>> {
        if alias.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut last_error = None;
        for selector in selectors(alias) {
            let cmd = format!("{} | Select-Object -ExpandProperty ValidDisplayValues", selector);
            match self.runner.run(&cmd, self.timeout) {
                Ok(output) => {
                    let options = non_blank_lines(&output);
                    if !options.is_empty() {
                        return Ok(options);
                    }
                }
                Err(e) => last_error = Some(e),
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }

    /// 读取当前生效的显示值，读取失败返回 None
    pub fn current_value(&self, alias: &str) -> Option<String> {
        if alias.trim().is_empty() {
            return None;
        }

        for selector in selectors(alias) {
            let cmd = format!("{} | Select-Object -ExpandProperty DisplayValue", selector);
            match self.runner.run(&cmd, self.timeout) {
                Ok(output) => {
                    if let Some(value) = non_blank_lines(&output).into_iter().next() {
                        return Some(value);
                    }
                }
                Err(e) => log::debug!("读取 {} 当前设置失败: {}", alias, e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{Reply, ScriptedRunner};

    fn build(runner: ScriptedRunner) -> (OptionResolver, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        (OptionResolver::new(runner.clone(), Duration::from_secs(6)), runner)
    }

    #[test]
    fn test_options_keep_system_order() {
        let (resolver, runner) = build(ScriptedRunner::new().on(
            "ValidDisplayValues",
            Reply::ok("自动侦测\r\n1.0 Gbps 全双工\r\n\r\n10 Mbps 半双工\r\n"),
        ));
        assert_eq!(
            resolver.get_options("以太网", false),
            vec!["自动侦测", "1.0 Gbps 全双工", "10 Mbps 半双工"]
        );
        assert_eq!(runner.call_count(), 1);
        assert!(runner.calls()[0].contains("*SpeedDuplex"));
    }

    #[test]
    fn test_display_name_selector_used_second() {
        let (resolver, runner) = build(
            ScriptedRunner::new()
                .on("-RegistryKeyword", Reply::ok(""))
                .on("-DisplayName", Reply::ok("Auto Negotiation\n100 Mbps Full Duplex")),
        );
        assert_eq!(
            resolver.get_options("以太网", false),
            vec!["Auto Negotiation", "100 Mbps Full Duplex"]
        );
        assert_eq!(runner.call_count(), 2);
    }

    #[test]
    fn test_fallback_never_empty() {
        let (resolver, _) = build(ScriptedRunner::new().on("ValidDisplayValues", Reply::fail("找不到")));
        let options = resolver.get_options("以太网", true);
        assert_eq!(options.len(), 6);
        assert_eq!(options[0], "自动侦测");
        assert_eq!(options[5], "1.0 Gbps 全双工");
    }

    #[test]
    fn test_strict_caller_gets_empty_list() {
        let (resolver, _) = build(ScriptedRunner::new().on("ValidDisplayValues", Reply::Timeout));
        assert!(resolver.get_options("以太网", false).is_empty());

        let (resolver, _) = build(ScriptedRunner::new().on("ValidDisplayValues", Reply::ok("  \n")));
        assert!(resolver.get_options("以太网", false).is_empty());
        assert_eq!(resolver.get_options("以太网", true).len(), 6);
    }

    #[test]
    fn test_alias_quotes_are_escaped() {
        let (resolver, runner) = build(ScriptedRunner::new().on("ValidDisplayValues", Reply::ok("x")));
        resolver.get_options(r#"Ethernet "Lab""#, false);
        assert!(runner.calls()[0].contains(r#"-Name "Ethernet `"Lab`"""#));
    }

    #[test]
    fn test_current_value() {
        let (resolver, _) = build(
            ScriptedRunner::new()
                .on("-RegistryKeyword", Reply::fail("不支持"))
                .on("-DisplayName", Reply::ok(" 100 Mbps 全双工 \r\n")),
        );
        assert_eq!(resolver.current_value("以太网").as_deref(), Some("100 Mbps 全双工"));

        let (resolver, _) = build(ScriptedRunner::new().on("DisplayValue", Reply::Timeout));
        assert_eq!(resolver.current_value("以太网"), None);
    }
}
