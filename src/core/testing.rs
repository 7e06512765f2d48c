//! 测试用的命令执行器替身

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::error::{EngineError, Result};
use crate::core::powershell::CommandRunner;

/// 预设的命令响应
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(String),
    Fail(String),
    Timeout,
    /// 先等待再成功返回
    Slow(Duration, String),
}

impl Reply {
    pub fn ok(s: &str) -> Self {
        Reply::Ok(s.to_string())
    }

    pub fn fail(s: &str) -> Self {
        Reply::Fail(s.to_string())
    }

    fn into_result(self, timeout: Duration) -> Result<String> {
        match self {
            Reply::Ok(s) => Ok(s),
            Reply::Fail(s) => Err(EngineError::NonZeroExit(s)),
            Reply::Timeout => Err(EngineError::Timeout(timeout)),
            Reply::Slow(delay, s) => {
                std::thread::sleep(delay);
                Ok(s)
            }
        }
    }
}

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// 按子串匹配命令并返回预设响应，同时记录所有调用
///
/// 规则按添加顺序匹配；序列中的最后一个响应会被重复使用
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, reply: Reply) -> Self {
        self.on_sequence(needle, vec![reply])
    }

    pub fn on_sequence(self, needle: &str, replies: Vec<Reply>) -> Self {
        self.rules.lock().push(Rule {
            needle: needle.to_string(),
            replies: replies.into(),
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.contains(needle)).count()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, script: &str, timeout: Duration) -> Result<String> {
        self.calls.lock().push(script.to_string());

        let reply = {
            let mut rules = self.rules.lock();
            rules
                .iter_mut()
                .find(|r| script.contains(&r.needle))
                .and_then(|r| {
                    if r.replies.len() > 1 {
                        r.replies.pop_front()
                    } else {
                        r.replies.front().cloned()
                    }
                })
        };

        match reply {
            Some(reply) => reply.into_result(timeout),
            None => Err(EngineError::NonZeroExit(format!("未配置的命令: {}", script))),
        }
    }
}
