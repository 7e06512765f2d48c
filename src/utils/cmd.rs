use std::ffi::OsStr;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Windows CREATE_NO_WINDOW 标志
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// 子进程状态轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 创建一个配置好的 Command，在 Windows 上隐藏控制台窗口
pub fn create_command<S: AsRef<OsStr>>(program: S) -> Command {
    let mut cmd = Command::new(program);

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd
}

/// 带超时执行的结果
#[derive(Debug)]
pub enum TimedOutput {
    /// 进程在时限内退出
    Finished(Output),
    /// 超时，进程已被终止
    TimedOut,
}

/// 执行命令，超过 `timeout` 时终止子进程
///
/// stdout/stderr 由独立线程读取，避免管道写满导致子进程阻塞。
/// 启动失败（例如程序不存在）以 `io::Error` 返回。
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<TimedOutput> {
    log::debug!("[CMD] {:?} (超时 {:?})", cmd, timeout);

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout_handle = child.stdout.take().map(spawn_reader);
    let stderr_handle = child.stderr.take().map(spawn_reader);

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = join_reader(stdout_handle);
                let stderr = join_reader(stderr_handle);
                log::debug!("[EXIT] {} ({:?})", status, start.elapsed());
                return Ok(TimedOutput::Finished(Output {
                    status,
                    stdout,
                    stderr,
                }));
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    log::warn!("命令执行超时 ({:?})，终止进程", timeout);
                    let _ = child.kill();
                    let _ = child.wait();
                    // 读取线程随管道关闭自行结束，这里不等待
                    return Ok(TimedOutput::TimedOut);
                }
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
