//! PowerShell 命令执行
//!
//! 按顺序尝试多个解释器位置：系统 PATH 中的 `powershell` 优先，
//! 然后是 Windows PowerShell 5.x 与 PowerShell 7.x 的固定安装路径。
//! 候选列表是数据而不是分支，便于测试替换。

use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::{EngineError, Result};
use crate::utils::cmd::{create_command, run_with_timeout, TimedOutput};
use crate::utils::encoding::decode_console_output;

/// 执行外部命令的抽象，所有上层组件都通过它访问系统
pub trait CommandRunner: Send + Sync {
    /// 执行脚本，成功时返回去掉首尾空白的标准输出
    fn run(&self, script: &str, timeout: Duration) -> Result<String>;

    /// 执行脚本，同时返回实际使用的解释器
    fn run_traced(&self, script: &str, timeout: Duration) -> Result<ScriptOutput> {
        self.run(script, timeout).map(|stdout| ScriptOutput {
            interpreter: "powershell".to_string(),
            stdout,
        })
    }
}

/// 解释器位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterpreterLocation {
    /// 通过 PATH 查找的程序名
    OnPath(String),
    /// 固定安装路径，不存在时直接跳过
    Absolute(PathBuf),
}

impl InterpreterLocation {
    fn program(&self) -> String {
        match self {
            InterpreterLocation::OnPath(name) => name.clone(),
            InterpreterLocation::Absolute(path) => path.to_string_lossy().to_string(),
        }
    }

    fn is_present(&self) -> bool {
        match self {
            InterpreterLocation::OnPath(_) => true,
            InterpreterLocation::Absolute(path) => path.exists(),
        }
    }
}

/// 默认的解释器候选列表
pub fn default_candidates() -> Vec<InterpreterLocation> {
    vec![
        InterpreterLocation::OnPath("powershell".to_string()),
        InterpreterLocation::Absolute(PathBuf::from(
            r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
        )),
        InterpreterLocation::Absolute(PathBuf::from(r"C:\Program Files\PowerShell\7\pwsh.exe")),
        InterpreterLocation::Absolute(PathBuf::from(
            r"C:\Program Files (x86)\PowerShell\7\pwsh.exe",
        )),
    ]
}

/// 一次成功执行的结果
#[derive(Debug, Clone)]
pub struct ScriptOutput {
    /// 实际使用的解释器
    pub interpreter: String,
    pub stdout: String,
}

/// 基于 PowerShell 解释器的命令执行器
pub struct PowerShellRunner {
    candidates: Vec<InterpreterLocation>,
}

impl PowerShellRunner {
    pub fn new() -> Self {
        Self::with_candidates(default_candidates())
    }

    pub fn with_candidates(candidates: Vec<InterpreterLocation>) -> Self {
        Self { candidates }
    }

    pub fn candidates(&self) -> &[InterpreterLocation] {
        &self.candidates
    }

    /// 执行脚本并返回使用的解释器
    ///
    /// - 候选不存在：跳过
    /// - 第一个候选非零退出：继续尝试下一个（容忍损坏的默认解释器）
    /// - 后续候选非零退出：返回其错误输出
    /// - 超时：立即返回，不在本层重试
    pub fn run_detailed(&self, script: &str, timeout: Duration) -> Result<ScriptOutput> {
        let mut first_failure: Option<EngineError> = None;

        for (index, location) in self.candidates.iter().enumerate() {
            if !location.is_present() {
                continue;
            }

            let program = location.program();
            let mut cmd = create_command(&program);
            cmd.args([
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-Command",
                script,
            ]);

            let output = match run_with_timeout(cmd, timeout) {
                Ok(TimedOutput::Finished(output)) => output,
                Ok(TimedOutput::TimedOut) => {
                    log::warn!("PowerShell命令超时 [{}]: {}", program, script);
                    return Err(EngineError::Timeout(timeout));
                }
                Err(e) => {
                    log::debug!("无法启动 {}: {}", program, e);
                    continue;
                }
            };

            let stdout = decode_console_output(&output.stdout).trim().to_string();
            if output.status.success() {
                return Ok(ScriptOutput {
                    interpreter: program,
                    stdout,
                });
            }

            let stderr = decode_console_output(&output.stderr).trim().to_string();
            let message = if !stderr.is_empty() {
                stderr
            } else if !stdout.is_empty() {
                stdout
            } else {
                "PowerShell命令执行失败".to_string()
            };

            if index == 0 {
                log::debug!("默认 PowerShell 执行失败，尝试下一个解释器: {}", message);
                first_failure = Some(EngineError::NonZeroExit(message));
                continue;
            }
            return Err(EngineError::NonZeroExit(message));
        }

        Err(first_failure.unwrap_or_else(|| EngineError::ToolUnavailable("PowerShell".to_string())))
    }
}

impl Default for PowerShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for PowerShellRunner {
    fn run(&self, script: &str, timeout: Duration) -> Result<String> {
        self.run_detailed(script, timeout).map(|o| o.stdout)
    }

    fn run_traced(&self, script: &str, timeout: Duration) -> Result<ScriptOutput> {
        self.run_detailed(script, timeout)
    }
}

/// 转义要放进 PowerShell 双引号字符串的值
///
/// 只防止破坏命令语法，不是完整的注入防护
pub fn escape_ps(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '`' | '"' | '\'' | '$' => {
                escaped.push('`');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// 按行拆分输出，去掉空行，保持原有顺序
pub fn non_blank_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_candidates_order() {
        let candidates = default_candidates();
        assert_eq!(candidates.len(), 4);
        assert_eq!(candidates[0], InterpreterLocation::OnPath("powershell".to_string()));
        assert!(matches!(candidates[1], InterpreterLocation::Absolute(_)));
    }

    #[test]
    fn test_missing_absolute_candidates_are_skipped() {
        let runner = PowerShellRunner::with_candidates(vec![
            InterpreterLocation::Absolute(PathBuf::from("/nonexistent/netduplex/powershell.exe")),
            InterpreterLocation::Absolute(PathBuf::from("/nonexistent/netduplex/pwsh.exe")),
        ]);
        let err = runner.run("echo test", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, EngineError::ToolUnavailable(_)));
    }

    #[test]
    fn test_unlaunchable_path_candidate_falls_through() {
        let runner = PowerShellRunner::with_candidates(vec![InterpreterLocation::OnPath(
            "netduplex-no-such-shell".to_string(),
        )]);
        let err = runner.run("echo test", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, EngineError::ToolUnavailable(_)));
    }

    /// 在临时目录写一个可执行脚本，模拟忽略参数的解释器
    #[cfg(unix)]
    fn fake_shell(name: &str, body: &str) -> InterpreterLocation {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("netduplex-shell-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        InterpreterLocation::Absolute(path)
    }

    #[test]
    #[cfg(unix)]
    fn test_broken_default_falls_through_to_next() {
        let runner = PowerShellRunner::with_candidates(vec![
            InterpreterLocation::OnPath("false".to_string()),
            InterpreterLocation::OnPath("true".to_string()),
        ]);
        let output = runner.run_detailed("echo test", Duration::from_secs(5)).unwrap();
        assert_eq!(output.interpreter, "true");
        assert_eq!(output.stdout, "");
    }

    #[test]
    #[cfg(unix)]
    fn test_later_failure_surfaces_error_text() {
        let runner = PowerShellRunner::with_candidates(vec![
            InterpreterLocation::OnPath("false".to_string()),
            fake_shell("failing.sh", "echo 找不到网卡 >&2\nexit 1"),
            InterpreterLocation::OnPath("true".to_string()),
        ]);
        match runner.run("echo test", Duration::from_secs(5)) {
            Err(EngineError::NonZeroExit(message)) => assert_eq!(message, "找不到网卡"),
            other => panic!("应返回非零退出: {:?}", other),
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_only_failures_report_first_exit() {
        let runner = PowerShellRunner::with_candidates(vec![
            InterpreterLocation::OnPath("false".to_string()),
            InterpreterLocation::Absolute(PathBuf::from("/nonexistent/netduplex/pwsh.exe")),
        ]);
        assert!(matches!(
            runner.run("echo test", Duration::from_secs(5)),
            Err(EngineError::NonZeroExit(_))
        ));
    }

    #[test]
    #[cfg(unix)]
    fn test_timeout_is_not_retried() {
        let runner = PowerShellRunner::with_candidates(vec![
            fake_shell("slow.sh", "exec sleep 5"),
            InterpreterLocation::OnPath("true".to_string()),
        ]);
        let start = std::time::Instant::now();
        assert!(matches!(
            runner.run("echo test", Duration::from_millis(300)),
            Err(EngineError::Timeout(_))
        ));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_escape_ps() {
        assert_eq!(escape_ps("以太网 2"), "以太网 2");
        assert_eq!(escape_ps(r#"a"b"#), r#"a`"b"#);
        assert_eq!(escape_ps("it's"), "it`'s");
        assert_eq!(escape_ps("$env"), "`$env");
    }

    #[test]
    fn test_non_blank_lines() {
        let lines = non_blank_lines("自动侦测\r\n\r\n 10 Mbps 半双工 \n1.0 Gbps 全双工\n");
        assert_eq!(lines, vec!["自动侦测", "10 Mbps 半双工", "1.0 Gbps 全双工"]);
    }
}
