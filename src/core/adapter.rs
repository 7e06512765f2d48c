//! 网络适配器数据模型
//!
//! 每次枚举都会生成新的 `Adapter` 快照，快照之间除 `alias` 外没有持久身份

use serde::Serialize;

/// 未知值的占位文本
pub const UNKNOWN: &str = "Unknown";

/// 已连接状态码（沿用 Win32_NetworkAdapter.NetConnectionStatus 的约定）
pub const STATUS_CONNECTED: u32 = 2;

/// 双工模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Duplex {
    Full,
    Half,
    #[default]
    Unknown,
}

impl Duplex {
    /// 解析 `Get-NetAdapter` 的 FullDuplex 输出（True/False）
    pub fn from_full_duplex_flag(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Duplex::Full,
            "false" => Duplex::Half,
            _ => Duplex::Unknown,
        }
    }
}

impl std::fmt::Display for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Duplex::Full => write!(f, "全双工"),
            Duplex::Half => write!(f, "半双工"),
            Duplex::Unknown => write!(f, "{}", UNKNOWN),
        }
    }
}

/// 单个物理网络适配器
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Adapter {
    /// 适配器描述（InterfaceDescription 或 WMI Name）
    pub name: String,
    /// 接口别名，所有写操作都以它为键
    pub alias: String,
    pub mac_address: String,
    pub device_id: Option<String>,
    /// 第一个 IPv4 地址，获取不到时为 "Unknown"
    pub ip_address: String,
    /// 连接状态码，2 表示已连接
    pub status: Option<u32>,
    /// 链路速度原始文本，例如 "1 Gbps"
    pub speed: String,
    pub duplex: Duplex,
}

impl Adapter {
    pub fn is_connected(&self) -> bool {
        self.status == Some(STATUS_CONNECTED)
    }

    /// 用于比较两次枚举结果的身份投影
    pub fn identity(&self) -> (&str, &str, &str) {
        (&self.name, &self.alias, &self.mac_address)
    }
}

/// 把 `Get-NetAdapter` 的 Status 文本映射为 NetConnectionStatus 数值
pub fn status_code_from_text(status: &str) -> Option<u32> {
    match status.trim().to_ascii_lowercase().as_str() {
        "up" | "connected" => Some(STATUS_CONNECTED),
        "disconnected" => Some(7),
        "disabled" => Some(5),
        "not present" => Some(4),
        _ => status.trim().parse().ok(),
    }
}

/// 检查 MAC 地址格式：6 组十六进制，使用 `-` 或 `:` 分隔
pub fn is_valid_mac(mac: &str) -> bool {
    let mac = mac.trim();
    let separator = match mac.chars().nth(2) {
        Some(c @ ('-' | ':')) => c,
        _ => return false,
    };

    let groups: Vec<&str> = mac.split(separator).collect();
    groups.len() == 6
        && groups
            .iter()
            .all(|g| g.len() == 2 && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// 名称中出现即排除的关键字
const BLACKLIST: &[&str] = &["Virtual", "Loopback"];

/// 判定无线网卡的关键字（小写比较）
const WIRELESS_KEYWORDS: &[&str] = &["wireless", "wi-fi", "wifi", "wlan"];

/// 适配器过滤规则
///
/// 虚拟/回环黑名单和 MAC 检查总是生效；是否排除无线网卡由调用方决定
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterFilter {
    pub exclude_wireless: bool,
}

impl AdapterFilter {
    pub fn wired_only() -> Self {
        Self {
            exclude_wireless: true,
        }
    }

    pub fn is_wireless(name: &str) -> bool {
        let lower = name.to_lowercase();
        WIRELESS_KEYWORDS.iter().any(|k| lower.contains(k))
    }

    /// 检查原始记录是否可以进入适配器目录
    pub fn admits(&self, name: &str, alias: &str, mac: &str) -> bool {
        if name.trim().is_empty() || alias.trim().is_empty() || !is_valid_mac(mac) {
            return false;
        }
        if BLACKLIST.iter().any(|b| name.contains(b)) {
            return false;
        }
        !(self.exclude_wireless && Self::is_wireless(name))
    }
}
