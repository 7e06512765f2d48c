//! 网络引擎门面
//!
//! 把各组件按配置组装起来，并管理三类后台任务：启动检查、枚举、设置。
//! 同一时刻最多一个枚举任务和一个设置任务；新的枚举会先取消旧的。

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::adapter::{Adapter, AdapterFilter};
use crate::core::cancel::CancelToken;
use crate::core::compatibility::{
    CompatibilityChecker, CompatibilityReport, HealthStatus, ProcessProbe, ToolProbe,
};
use crate::core::config::EngineConfig;
use crate::core::connection::{ConnectionManager, SessionFactory, ThreadRegistration};
use crate::core::convergence::{ConvergenceOutcome, ConvergencePoller, ConvergenceTracker};
use crate::core::detail::DetailResolver;
use crate::core::enumerator::{AdapterEnumerator, EnumeratorOptions};
use crate::core::error::{EngineError, Result};
use crate::core::events::{EngineEvent, EventSink};
use crate::core::options::OptionResolver;
use crate::core::powershell::{CommandRunner, PowerShellRunner};
use crate::core::settings::SettingsApplier;
use crate::core::wmi::{AdapterSession, WmiSessionFactory};
use crate::utils::privilege::is_admin;

/// 设置结果的确认状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ApplyStatus {
    /// 重新读取到了目标值
    Confirmed(String),
    /// 写入成功但在轮询次数内未读到目标值
    Unconfirmed { last_observed: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub message: String,
    pub status: ApplyStatus,
}

impl ApplyReport {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.status, ApplyStatus::Confirmed(_))
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.status {
            ApplyStatus::Confirmed(_) => write!(f, "{}，设置已生效", self.message),
            ApplyStatus::Unconfirmed { last_observed } => {
                write!(f, "{}，但设置可能未立即生效", self.message)?;
                if let Some(value) = last_observed {
                    write!(f, "（当前读取值: {}）", value)?;
                }
                write!(f, "，可稍后刷新或尝试重启适配器")
            }
        }
    }
}

/// 后台任务句柄
struct WorkerHandle {
    name: &'static str,
    cancel: CancelToken,
    /// 任务结束时发送端被丢弃
    done: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn spawn<T>(name: &'static str, task: T) -> Result<Self>
    where
        T: FnOnce(CancelToken) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();
        let (done_tx, done) = mpsc::channel::<()>();

        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _done = done_tx;
                task(token);
            })?;

        Ok(Self {
            name,
            cancel,
            done,
            join: Some(join),
        })
    }

    fn is_running(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Empty))
    }

    /// 请求取消并在宽限期内等待结束；超时则放弃等待，线程自行结束
    fn stop(mut self, grace: Duration) -> bool {
        self.cancel.cancel();
        match self.done.recv_timeout(grace) {
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("{} 任务未在 {:?} 内停止，已放弃等待", self.name, grace);
                false
            }
            _ => {
                if let Some(join) = self.join.take() {
                    if join.join().is_err() {
                        log::warn!("{} 任务异常退出", self.name);
                    }
                }
                true
            }
        }
    }
}

/// 带一次自动重试的枚举：失败后重连 WMI，等待片刻再试
fn enumerate_with_retry<F>(
    enumerator: &AdapterEnumerator,
    connection: &ConnectionManager<F>,
    events: &EventSink,
    retry_delay: Duration,
    cancel: &CancelToken,
) -> Result<Vec<Adapter>>
where
    F: SessionFactory,
{
    match enumerator.list_adapters_with_cancel(cancel) {
        Err(EngineError::EnumerationFailed(reason)) => {
            log::warn!("刷新失败，准备重连后重试: {}", reason);
            events.progress("刷新失败，正在重新连接WMI后重试...");
            if let Err(e) = connection.reconnect() {
                log::warn!("重新连接WMI失败: {}", e);
            }
            if !cancel.sleep(retry_delay) {
                return Err(EngineError::Cancelled);
            }
            enumerator.list_adapters_with_cancel(cancel)
        }
        other => other,
    }
}

/// 写入设置并轮询确认
fn apply_and_confirm_with(
    applier: &SettingsApplier,
    options: &OptionResolver,
    poller: &ConvergencePoller,
    alias: &str,
    value: &str,
    cancel: &CancelToken,
) -> Result<ApplyReport> {
    let tracker = ConvergenceTracker::new(alias, value).begin_apply();

    let message = match applier.apply(alias, value) {
        Ok(message) => message,
        Err(e) => {
            let tracker = match e {
                EngineError::PrivilegeDenied(_) | EngineError::InvalidArgument(_) => tracker.reject(),
                _ => tracker.apply_finished(false),
            };
            log::debug!("设置流程结束于 {:?}", tracker.state());
            return Err(e);
        }
    };

    let tracker = poller.poll(
        tracker.apply_finished(true),
        cancel,
        |alias| options.current_value(alias),
        |delay| {
            cancel.sleep(delay);
        },
    );

    let status = match tracker.outcome() {
        Some(ConvergenceOutcome::Converged { value, .. }) => ApplyStatus::Confirmed(value),
        Some(ConvergenceOutcome::GaveUp { last_observed, .. }) => {
            ApplyStatus::Unconfirmed { last_observed }
        }
        None => ApplyStatus::Unconfirmed {
            last_observed: None,
        },
    };

    Ok(ApplyReport { message, status })
}

/// 网络适配器速度/双工引擎
pub struct NetworkEngine<F: SessionFactory = WmiSessionFactory> {
    config: EngineConfig,
    connection: Arc<ConnectionManager<F>>,
    enumerator: Arc<AdapterEnumerator>,
    options: Arc<OptionResolver>,
    applier: Arc<SettingsApplier>,
    poller: Arc<ConvergencePoller>,
    checker: Arc<CompatibilityChecker>,
    events: EventSink,
    startup: Mutex<Option<WorkerHandle>>,
    enumeration: Mutex<Option<WorkerHandle>>,
    settings: Mutex<Option<WorkerHandle>>,
}

impl NetworkEngine<WmiSessionFactory> {
    /// 使用系统 PowerShell 与 WMI 创建引擎
    pub fn new(config: EngineConfig, events: EventSink) -> Self {
        let admin = is_admin();
        log::info!("管理员权限: {}", if admin { "是" } else { "否" });

        Self::with_parts(
            config,
            Arc::new(PowerShellRunner::new()),
            WmiSessionFactory::default(),
            admin,
            Arc::new(ProcessProbe),
            events,
        )
    }
}

impl<F> NetworkEngine<F>
where
    F: SessionFactory,
    F::Session: AdapterSession,
{
    pub fn with_parts(
        config: EngineConfig,
        runner: Arc<dyn CommandRunner>,
        factory: F,
        admin: bool,
        tools: Arc<dyn ToolProbe>,
        events: EventSink,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(factory, config.connection_options()));
        let details = DetailResolver::new(runner.clone(), config.detail_timeout());

        let enumerator = AdapterEnumerator::new(
            runner.clone(),
            connection.clone(),
            details,
            EnumeratorOptions {
                list_timeout: config.enumeration_timeout(),
                pool_size: config.thread_pool_size,
                item_timeout: config.detail_item_timeout(),
                filter: AdapterFilter {
                    exclude_wireless: config.exclude_wireless,
                },
            },
        )
        .with_events(events.clone());

        let options = OptionResolver::new(runner.clone(), config.options_timeout());
        let applier = SettingsApplier::new(runner.clone(), admin, config.apply_timeout())
            .with_events(events.clone());
        let poller = ConvergencePoller::new(config.poll_schedule(), events.clone());
        let checker = CompatibilityChecker::new(runner, connection.clone(), tools, admin)
            .with_query_timeout(config.powershell_timeout());

        Self {
            config,
            connection,
            enumerator: Arc::new(enumerator),
            options: Arc::new(options),
            applier: Arc::new(applier),
            poller: Arc::new(poller),
            checker: Arc::new(checker),
            events,
            startup: Mutex::new(None),
            enumeration: Mutex::new(None),
            settings: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<F>> {
        &self.connection
    }

    pub fn is_admin(&self) -> bool {
        self.applier.is_admin()
    }

    pub fn health_check(&self) -> HealthStatus {
        let span = tracing::info_span!("health_check");
        let _enter = span.enter();
        self.checker.health_check()
    }

    pub fn compatibility_report(&self) -> CompatibilityReport {
        self.checker.report()
    }

    /// 同步枚举（含一次自动重试）
    pub fn list_adapters(&self) -> Result<Vec<Adapter>> {
        let span = tracing::info_span!("enumeration");
        let _enter = span.enter();
        enumerate_with_retry(
            &self.enumerator,
            &self.connection,
            &self.events,
            self.config.refresh_retry_delay(),
            &CancelToken::new(),
        )
    }

    pub fn find_adapter(&self, name: &str) -> Result<Option<Adapter>> {
        self.enumerator.find_adapter(name)
    }

    pub fn get_options(&self, alias: &str, allow_fallback: bool) -> Vec<String> {
        self.options.get_options(alias, allow_fallback)
    }

    pub fn current_value(&self, alias: &str) -> Option<String> {
        self.options.current_value(alias)
    }

    /// 只写入，不确认
    pub fn apply(&self, alias: &str, value: &str) -> Result<String> {
        self.applier.apply(alias, value)
    }

    /// 写入并轮询确认
    pub fn apply_and_confirm(&self, alias: &str, value: &str) -> Result<ApplyReport> {
        let span = tracing::info_span!("apply", alias = alias);
        let _enter = span.enter();
        apply_and_confirm_with(
            &self.applier,
            &self.options,
            &self.poller,
            alias,
            value,
            &CancelToken::new(),
        )
    }

    pub fn restart_adapter(&self, alias: &str) -> Result<String> {
        self.applier.restart_adapter(alias)
    }

    /// 后台执行启动检查，结果以 [`EngineEvent::HealthChecked`] 发出
    pub fn spawn_health_check(&self) -> Result<()> {
        let checker = self.checker.clone();
        let factory = self.connection.factory();
        let events = self.events.clone();

        let handle = WorkerHandle::spawn("health-check", move |_cancel| {
            let _registration = ThreadRegistration::new(factory);
            let span = tracing::info_span!("health_check");
            let _enter = span.enter();

            events.progress("正在检查系统环境...");
            let status = checker.health_check();
            if let Some(message) = status.failure_message() {
                log::error!("{}", message);
            }
            events.emit(EngineEvent::HealthChecked(status));
        })?;

        if let Some(previous) = self.startup.lock().replace(handle) {
            previous.stop(self.config.worker_grace());
        }
        Ok(())
    }

    pub fn is_enumerating(&self) -> bool {
        self.enumeration
            .lock()
            .as_ref()
            .is_some_and(WorkerHandle::is_running)
    }

    /// 后台刷新适配器列表
    ///
    /// 已有枚举任务时先取消并等待其结束（最多 `worker_grace_ms`）
    pub fn spawn_enumeration(&self) -> Result<()> {
        let mut slot = self.enumeration.lock();
        if let Some(previous) = slot.take() {
            if previous.is_running() {
                log::info!("取消正在进行的枚举任务");
                previous.stop(self.config.worker_grace());
            }
        }

        let enumerator = self.enumerator.clone();
        let connection = self.connection.clone();
        let events = self.events.clone();
        let retry_delay = self.config.refresh_retry_delay();

        let handle = WorkerHandle::spawn("enumeration", move |cancel| {
            let _registration = ThreadRegistration::new(connection.factory());
            let span = tracing::info_span!("enumeration");
            let _enter = span.enter();

            match enumerate_with_retry(&enumerator, &connection, &events, retry_delay, &cancel) {
                Ok(adapters) => events.emit(EngineEvent::AdaptersLoaded(adapters)),
                Err(EngineError::Cancelled) => log::info!("枚举任务已取消"),
                Err(e) => {
                    log::error!("刷新适配器列表失败: {}", e);
                    events.emit(EngineEvent::EnumerationFailed(e.to_string()));
                }
            }
        })?;

        *slot = Some(handle);
        Ok(())
    }

    pub fn is_applying(&self) -> bool {
        self.settings
            .lock()
            .as_ref()
            .is_some_and(WorkerHandle::is_running)
    }

    /// 后台写入设置并确认，结果以 [`EngineEvent::ApplyFinished`] 发出
    pub fn spawn_apply(&self, alias: &str, value: &str) -> Result<()> {
        let mut slot = self.settings.lock();
        if slot.as_ref().is_some_and(WorkerHandle::is_running) {
            return Err(EngineError::Busy("设置".to_string()));
        }

        let applier = self.applier.clone();
        let options = self.options.clone();
        let poller = self.poller.clone();
        let events = self.events.clone();
        let alias = alias.to_string();
        let value = value.to_string();

        let handle = WorkerHandle::spawn("settings", move |cancel| {
            let span = tracing::info_span!("apply", alias = alias.as_str());
            let _enter = span.enter();

            let result =
                apply_and_confirm_with(&applier, &options, &poller, &alias, &value, &cancel);
            if let Err(ref e) = result {
                log::error!("设置 {} 失败: {}", alias, e);
            }
            events.emit(EngineEvent::ApplyFinished(result.map_err(|e| e.to_string())));
        })?;

        *slot = Some(handle);
        Ok(())
    }

    /// 停止所有后台任务并释放 WMI 会话
    pub fn shutdown(&self) {
        let grace = self.config.worker_grace();
        for slot in [&self.startup, &self.enumeration, &self.settings] {
            let handle = slot.lock().take();
            if let Some(handle) = handle {
                handle.stop(grace);
            }
        }
        self.connection.dispose();
        log::info!("引擎已关闭");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{Reply, ScriptedRunner};
    use crate::core::wmi::WmiAdapterRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const ONE_ADAPTER_JSON: &str = r#"{"Name":"以太网","InterfaceDescription":"Intel(R) Ethernet Connection I219-V","MacAddress":"00-1A-2B-3C-4D-5E","Status":"Up","LinkSpeed":"1 Gbps"}"#;

    struct FakeSession {
        records: Vec<WmiAdapterRecord>,
        fail: bool,
    }

    impl AdapterSession for FakeSession {
        fn physical_adapters(&self) -> Result<Vec<WmiAdapterRecord>> {
            if self.fail {
                Err(EngineError::NonZeroExit("模拟查询失败".to_string()))
            } else {
                Ok(self.records.clone())
            }
        }
    }

    /// 前 `failing_sessions` 个会话查询失败
    #[derive(Default)]
    struct FakeFactory {
        records: Vec<WmiAdapterRecord>,
        failing_sessions: usize,
        opens: AtomicUsize,
    }

    impl SessionFactory for FakeFactory {
        type Session = FakeSession;

        fn open(&self) -> Result<FakeSession> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(FakeSession {
                records: self.records.clone(),
                fail: n <= self.failing_sessions,
            })
        }
    }

    struct NoTools;

    impl ToolProbe for NoTools {
        fn probe(&self, _: &str, _: &[&str], _: Duration) -> Option<(bool, String)> {
            None
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            wmi_timeout_secs: 2,
            retry_backoff_ms: 0,
            settle_delay_ms: 0,
            convergence_delays_ms: vec![0, 0],
            refresh_retry_delay_ms: 0,
            ..Default::default()
        }
    }

    fn engine(
        runner: ScriptedRunner,
        factory: FakeFactory,
        admin: bool,
    ) -> (NetworkEngine<FakeFactory>, Arc<ScriptedRunner>, Receiver<EngineEvent>) {
        let runner = Arc::new(runner);
        let (tx, rx) = mpsc::channel();
        let engine = NetworkEngine::with_parts(
            fast_config(),
            runner.clone(),
            factory,
            admin,
            Arc::new(NoTools),
            EventSink::new(tx),
        );
        (engine, runner, rx)
    }

    fn wmi_record() -> WmiAdapterRecord {
        WmiAdapterRecord {
            name: Some("Realtek PCIe GbE Family Controller".to_string()),
            device_id: Some("1".to_string()),
            mac_address: Some("00:1A:2B:3C:4D:5E".to_string()),
            net_connection_id: Some("以太网".to_string()),
            net_connection_status: Some(2),
            physical: true,
        }
    }

    fn detail_rules(runner: ScriptedRunner) -> ScriptedRunner {
        runner
            .on("Get-NetIPAddress", Reply::ok("192.168.1.20"))
            .on("FullDuplex", Reply::ok("True"))
            .on(".LinkSpeed", Reply::ok("1 Gbps"))
    }

    /// 等待满足条件的事件
    fn wait_for(rx: &Receiver<EngineEvent>, pred: impl Fn(&EngineEvent) -> bool) -> Option<EngineEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_refresh_retries_once_after_reconnect() {
        let factory = FakeFactory {
            records: vec![wmi_record()],
            failing_sessions: 1,
            ..Default::default()
        };
        let (engine, _, rx) = engine(
            detail_rules(ScriptedRunner::new().on("ConvertTo-Json", Reply::fail("Get-NetAdapter 不可用"))),
            factory,
            true,
        );

        let adapters = engine.list_adapters().unwrap();
        assert_eq!(adapters.len(), 1);
        assert_eq!(engine.connection().factory().opens.load(Ordering::SeqCst), 2);

        let events: Vec<EngineEvent> = rx.try_iter().collect();
        assert!(events
            .iter()
            .any(|e| matches!(e, EngineEvent::Progress(m) if m.contains("重试"))));
    }

    #[test]
    fn test_refresh_retry_is_not_repeated() {
        let factory = FakeFactory {
            records: vec![wmi_record()],
            failing_sessions: 10,
            ..Default::default()
        };
        let (engine, _, _rx) = engine(
            ScriptedRunner::new().on("ConvertTo-Json", Reply::Timeout),
            factory,
            true,
        );

        assert!(matches!(
            engine.list_adapters(),
            Err(EngineError::EnumerationFailed(_))
        ));
        assert_eq!(engine.connection().factory().opens.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_apply_and_confirm_converges() {
        let (engine, _, _rx) = engine(
            ScriptedRunner::new()
                .on("Set-NetAdapterAdvancedProperty", Reply::ok(""))
                .on_sequence(
                    "ExpandProperty DisplayValue",
                    vec![
                        Reply::ok("100 Mbps 半双工"),
                        Reply::ok("100 Mbps 半双工"),
                        Reply::ok("1.0 Gbps 全双工"),
                    ],
                ),
            FakeFactory::default(),
            true,
        );

        let report = engine.apply_and_confirm("以太网", "1.0 Gbps 全双工").unwrap();
        assert_eq!(report.status, ApplyStatus::Confirmed("1.0 Gbps 全双工".to_string()));
        assert!(report.to_string().contains("已生效"));
    }

    #[test]
    fn test_apply_and_confirm_unconfirmed_is_not_failure() {
        let (engine, _, _rx) = engine(
            ScriptedRunner::new()
                .on("Set-NetAdapterAdvancedProperty", Reply::ok(""))
                .on("ExpandProperty DisplayValue", Reply::ok("100 Mbps 半双工")),
            FakeFactory::default(),
            true,
        );

        let report = engine.apply_and_confirm("以太网", "1.0 Gbps 全双工").unwrap();
        assert!(!report.is_confirmed());
        assert_eq!(
            report.status,
            ApplyStatus::Unconfirmed {
                last_observed: Some("100 Mbps 半双工".to_string())
            }
        );
        assert!(report.to_string().contains("可能未立即生效"));
    }

    #[test]
    fn test_apply_without_admin_runs_nothing() {
        let (engine, runner, _rx) = engine(ScriptedRunner::new(), FakeFactory::default(), false);
        let err = engine.apply_and_confirm("以太网", "1.0 Gbps 全双工").unwrap_err();
        assert!(err.needs_elevation());
        assert_eq!(runner.call_count(), 0);
    }

    #[test]
    fn test_second_enumeration_cancels_first() {
        let (engine, _, rx) = engine(
            detail_rules(ScriptedRunner::new().on_sequence(
                "ConvertTo-Json",
                vec![
                    Reply::Slow(Duration::from_millis(300), ONE_ADAPTER_JSON.to_string()),
                    Reply::ok(ONE_ADAPTER_JSON),
                ],
            )),
            FakeFactory::default(),
            true,
        );

        engine.spawn_enumeration().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(engine.is_enumerating());
        engine.spawn_enumeration().unwrap();

        let loaded = wait_for(&rx, |e| matches!(e, EngineEvent::AdaptersLoaded(_)));
        match loaded {
            Some(EngineEvent::AdaptersLoaded(adapters)) => assert_eq!(adapters.len(), 1),
            other => panic!("未收到枚举结果: {:?}", other),
        }

        engine.shutdown();
        let extra = rx
            .try_iter()
            .filter(|e| matches!(e, EngineEvent::AdaptersLoaded(_)))
            .count();
        assert_eq!(extra, 0);
    }

    #[test]
    fn test_only_one_settings_worker() {
        let (engine, _, rx) = engine(
            ScriptedRunner::new()
                .on(
                    "Set-NetAdapterAdvancedProperty",
                    Reply::Slow(Duration::from_millis(300), String::new()),
                )
                .on("ExpandProperty DisplayValue", Reply::ok("1.0 Gbps 全双工")),
            FakeFactory::default(),
            true,
        );

        engine.spawn_apply("以太网", "1.0 Gbps 全双工").unwrap();
        assert!(matches!(
            engine.spawn_apply("以太网", "100 Mbps 全双工"),
            Err(EngineError::Busy(_))
        ));

        let finished = wait_for(&rx, |e| matches!(e, EngineEvent::ApplyFinished(_)));
        match finished {
            Some(EngineEvent::ApplyFinished(Ok(report))) => assert!(report.is_confirmed()),
            other => panic!("意外的结果: {:?}", other),
        }

        // 上一个任务结束后可以再次提交
        let deadline = Instant::now() + Duration::from_secs(2);
        while engine.is_applying() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(engine.spawn_apply("以太网", "1.0 Gbps 全双工").is_ok());
        engine.shutdown();
    }

    #[test]
    fn test_spawn_health_check_reports_status() {
        let (engine, _, rx) = engine(
            ScriptedRunner::new().on("echo", Reply::ok("test")),
            FakeFactory::default(),
            false,
        );
        engine.spawn_health_check().unwrap();

        match wait_for(&rx, |e| matches!(e, EngineEvent::HealthChecked(_))) {
            Some(EngineEvent::HealthChecked(status)) => {
                assert!(status.wmi_available);
                assert!(status.powershell_available);
                assert!(!status.admin_rights);
            }
            other => panic!("未收到检查结果: {:?}", other),
        }
        engine.shutdown();
    }
}
