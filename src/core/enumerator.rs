//! 物理网络适配器枚举
//!
//! 首选 `Get-NetAdapter` 的 JSON 输出；没有可用结果时退回 WMI 会话，
//! 详细信息交给有界线程池并行获取。两条路径都失败才返回错误。

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::core::adapter::{status_code_from_text, Adapter, AdapterFilter, UNKNOWN};
use crate::core::cancel::CancelToken;
use crate::core::connection::{ConnectionManager, SessionFactory};
use crate::core::detail::DetailResolver;
use crate::core::error::{EngineError, Result};
use crate::core::events::{EngineEvent, EventSink};
use crate::core::powershell::CommandRunner;
use crate::core::wmi::{AdapterSession, WmiAdapterRecord};
use crate::core::worker_pool::BoundedPool;

const LIST_COMMAND: &str = "Get-NetAdapter -Physical | Select-Object Name,InterfaceDescription,MacAddress,Status,LinkSpeed | ConvertTo-Json -Depth 2";

/// 兜底路径的数据来源
pub trait PhysicalAdapterSource: Send + Sync {
    fn physical_adapters(&self) -> Result<Vec<WmiAdapterRecord>>;
}

impl<F> PhysicalAdapterSource for ConnectionManager<F>
where
    F: SessionFactory,
    F::Session: AdapterSession,
{
    fn physical_adapters(&self) -> Result<Vec<WmiAdapterRecord>> {
        self.with_session(|session| session.physical_adapters())
    }
}

/// `Get-NetAdapter | ConvertTo-Json` 的单条记录
///
/// 只有一个适配器时输出是对象而不是数组，字段也可能缺失
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetAdapterRecord {
    pub name: Option<String>,
    pub interface_description: Option<String>,
    pub mac_address: Option<String>,
    /// 不同系统版本下可能是文本 ("Up") 或数值
    pub status: Option<serde_json::Value>,
    pub link_speed: Option<String>,
}

impl NetAdapterRecord {
    fn status_code(&self) -> Option<u32> {
        match self.status.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            serde_json::Value::String(s) => status_code_from_text(s),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NetAdapterJson {
    Many(Vec<NetAdapterRecord>),
    Single(NetAdapterRecord),
}

/// 解析 `Get-NetAdapter` 的 JSON 输出
pub fn parse_net_adapter_json(output: &str) -> Result<Vec<NetAdapterRecord>> {
    let output = output.trim().trim_start_matches('\u{feff}');
    if output.is_empty() {
        return Err(EngineError::ParseFailure("Get-NetAdapter 没有输出".to_string()));
    }

    match serde_json::from_str::<NetAdapterJson>(output) {
        Ok(NetAdapterJson::Many(records)) => Ok(records),
        Ok(NetAdapterJson::Single(record)) => Ok(vec![record]),
        Err(e) => Err(EngineError::ParseFailure(e.to_string())),
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 枚举参数
#[derive(Debug, Clone, Copy)]
pub struct EnumeratorOptions {
    /// `Get-NetAdapter` 列表命令的超时
    pub list_timeout: Duration,
    pub pool_size: usize,
    /// 兜底路径中单个适配器详细信息的超时
    pub item_timeout: Duration,
    pub filter: AdapterFilter,
}

impl Default for EnumeratorOptions {
    fn default() -> Self {
        Self {
            list_timeout: Duration::from_secs(6),
            pool_size: 4,
            item_timeout: Duration::from_secs(10),
            filter: AdapterFilter::default(),
        }
    }
}

/// 适配器枚举器
pub struct AdapterEnumerator {
    runner: Arc<dyn CommandRunner>,
    source: Arc<dyn PhysicalAdapterSource>,
    details: DetailResolver,
    options: EnumeratorOptions,
    events: EventSink,
}

impl AdapterEnumerator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        source: Arc<dyn PhysicalAdapterSource>,
        details: DetailResolver,
        options: EnumeratorOptions,
    ) -> Self {
        Self {
            runner,
            source,
            details,
            options,
            events: EventSink::none(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn filter(&self) -> AdapterFilter {
        self.options.filter
    }

    pub fn list_adapters(&self) -> Result<Vec<Adapter>> {
        self.list_adapters_with_cancel(&CancelToken::new())
    }

    /// 枚举物理适配器，在各阶段之间检查取消标志
    pub fn list_adapters_with_cancel(&self, cancel: &CancelToken) -> Result<Vec<Adapter>> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        self.events.emit(EngineEvent::EnumerationStarted);

        let primary_error = match self.list_via_powershell(cancel) {
            Ok(adapters) if !adapters.is_empty() => {
                log::info!("适配器枚举使用: PowerShell(Get-NetAdapter)，找到 {} 个", adapters.len());
                return Ok(adapters);
            }
            Ok(_) => {
                log::info!("Get-NetAdapter 未返回可用适配器，尝试 WMI 兜底");
                "未返回可用适配器".to_string()
            }
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(e) => {
                log::warn!("Get-NetAdapter 枚举失败，尝试 WMI 兜底: {}", e);
                e.to_string()
            }
        };

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match self.list_via_wmi(cancel) {
            Ok(adapters) => {
                log::info!("适配器枚举使用: WMI 兜底，找到 {} 个", adapters.len());
                Ok(adapters)
            }
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => {
                log::error!("适配器枚举失败: PowerShell: {}; WMI: {}", primary_error, e);
                Err(EngineError::EnumerationFailed(format!(
                    "PowerShell: {}; WMI: {}",
                    primary_error, e
                )))
            }
        }
    }

    /// 按描述或别名查找（不区分大小写的子串匹配）
    pub fn find_adapter(&self, name: &str) -> Result<Option<Adapter>> {
        let adapters = self.list_adapters()?;
        Ok(find_in(&adapters, name).cloned())
    }

    fn list_via_powershell(&self, cancel: &CancelToken) -> Result<Vec<Adapter>> {
        self.events.command_batch("正在通过 Get-NetAdapter 获取适配器...");
        let output = self.runner.run(LIST_COMMAND, self.options.list_timeout)?;
        let records = parse_net_adapter_json(&output)?;

        let mut adapters = Vec::new();
        for record in records {
            let (Some(name), Some(alias), Some(mac)) = (
                non_blank(&record.interface_description),
                non_blank(&record.name),
                non_blank(&record.mac_address),
            ) else {
                continue;
            };
            if !self.options.filter.admits(&name, &alias, &mac) {
                continue;
            }
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            self.events
                .command_batch(format!("正在获取 {} 的详细信息...", alias));
            let status = record.status_code();
            let link_speed = non_blank(&record.link_speed);
            adapters.push(self.enrich(name, alias, mac, status, link_speed));
        }
        // 详细信息查询期间可能已被取消或被新的枚举替换
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(adapters)
    }

    /// IP 与双工并行查询；列表已带链路速度时直接使用
    fn enrich(
        &self,
        name: String,
        alias: String,
        mac_address: String,
        status: Option<u32>,
        link_speed: Option<String>,
    ) -> Adapter {
        let details = &self.details;
        let alias_ref = alias.as_str();

        let (ip_address, duplex, speed) = std::thread::scope(|s| {
            let ip = s.spawn(|| details.ip_address(alias_ref));
            let duplex = s.spawn(|| details.duplex(alias_ref));
            let speed = link_speed.unwrap_or_else(|| details.link_speed(alias_ref));
            (
                ip.join().unwrap_or_else(|_| UNKNOWN.to_string()),
                duplex.join().unwrap_or_default(),
                speed,
            )
        });

        Adapter {
            name,
            alias,
            mac_address,
            device_id: None,
            ip_address,
            status,
            speed,
            duplex,
        }
    }

    fn list_via_wmi(&self, cancel: &CancelToken) -> Result<Vec<Adapter>> {
        self.events.command_batch("正在通过 WMI 获取适配器...");
        let records = self.source.physical_adapters()?;

        let filter = self.options.filter;
        let accepted: Vec<WmiAdapterRecord> = records
            .into_iter()
            .filter(|r| r.physical)
            .filter(|r| match (r.name.as_deref(), r.alias(), r.mac_address.as_deref()) {
                (Some(name), Some(alias), Some(mac)) => filter.admits(name, alias, mac),
                _ => false,
            })
            .collect();

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let names: Vec<String> = accepted
            .iter()
            .map(|r| r.name.clone().unwrap_or_default())
            .collect();
        let details = self.details.clone();
        let pool = BoundedPool::new(self.options.pool_size, self.options.item_timeout);

        let results = pool.run(accepted, move |record| {
            let alias = record.alias().unwrap_or_default().trim().to_string();
            Adapter {
                name: record.name.clone().unwrap_or_default().trim().to_string(),
                mac_address: record.mac_address.clone().unwrap_or_default().trim().to_string(),
                device_id: record.device_id.clone(),
                ip_address: details.ip_address(&alias),
                status: record.net_connection_status,
                speed: details.link_speed(&alias),
                duplex: details.duplex(&alias),
                alias,
            }
        });

        let adapters = results
            .into_iter()
            .zip(names)
            .filter_map(|(result, name)| match result {
                Ok(adapter) => Some(adapter),
                Err(failure) => {
                    log::warn!("获取适配器 {} 详细信息失败: {}", name, failure);
                    None
                }
            })
            .collect();

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(adapters)
    }
}

/// 在已有目录中按描述或别名查找
pub fn find_in<'a>(adapters: &'a [Adapter], name: &str) -> Option<&'a Adapter> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    adapters.iter().find(|a| {
        a.name.to_lowercase().contains(&needle) || a.alias.to_lowercase().contains(&needle)
    })
}
