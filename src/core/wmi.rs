//! WMI 网络适配器会话
//!
//! Windows 上通过 COM 直接查询 `Win32_NetworkAdapter`，替代 wmic 命令行；
//! 其他平台提供一个总是返回“不支持”的实现，保证上层逻辑可以编译和测试。

use crate::core::connection::SessionFactory;
use crate::core::error::Result;

/// `Win32_NetworkAdapter` 的一条记录，所有字段都可能缺失
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WmiAdapterRecord {
    pub name: Option<String>,
    pub device_id: Option<String>,
    pub mac_address: Option<String>,
    pub net_connection_id: Option<String>,
    pub net_connection_status: Option<u32>,
    pub physical: bool,
}

impl WmiAdapterRecord {
    /// 写操作使用的别名：NetConnectionID，缺失时退回 Name
    pub fn alias(&self) -> Option<&str> {
        self.net_connection_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or(self.name.as_deref())
    }
}

/// 能列出物理网卡的会话
pub trait AdapterSession {
    fn physical_adapters(&self) -> Result<Vec<WmiAdapterRecord>>;
}

#[cfg(windows)]
pub use self::com::{WmiSession, WmiSessionFactory};

#[cfg(not(windows))]
pub use self::unsupported::{WmiSession, WmiSessionFactory};

#[cfg(windows)]
mod com {
    use std::cell::Cell;
    use std::sync::Once;

    use windows::core::{BSTR, VARIANT};
    use windows::Win32::System::Com::{
        CoCreateInstance, CoInitializeEx, CoInitializeSecurity, CoSetProxyBlanket,
        CoUninitialize, CLSCTX_INPROC_SERVER, COINIT_MULTITHREADED, EOAC_NONE,
        RPC_C_AUTHN_LEVEL_CALL, RPC_C_AUTHN_LEVEL_DEFAULT, RPC_C_IMP_LEVEL_IMPERSONATE,
    };
    use windows::Win32::System::Variant::{VARENUM, VT_BSTR, VT_EMPTY, VT_I2, VT_I4, VT_NULL, VT_UI2, VT_UI4};
    use windows::Win32::System::Wmi::{
        IEnumWbemClassObject, IWbemClassObject, IWbemLocator, IWbemServices, WbemLocator,
        WBEM_FLAG_FORWARD_ONLY, WBEM_FLAG_RETURN_IMMEDIATELY,
    };

    use super::{AdapterSession, SessionFactory, WmiAdapterRecord};
    use crate::core::error::{EngineError, Result};

    // RPC 常量定义
    const RPC_C_AUTHN_DEFAULT: u32 = 0xFFFFFFFF;
    const RPC_C_AUTHZ_NONE: u32 = 0;

    const ADAPTER_QUERY: &str = "SELECT Name, DeviceID, MACAddress, NetConnectionID, \
        NetConnectionStatus, PhysicalAdapter FROM Win32_NetworkAdapter WHERE PhysicalAdapter = TRUE";

    static SECURITY_INIT: Once = Once::new();

    thread_local! {
        /// 当前线程是否由我们完成了 COM 初始化
        static COM_REGISTERED: Cell<bool> = const { Cell::new(false) };
    }

    /// WMI 会话
    pub struct WmiSession {
        services: IWbemServices,
    }

    // 会话在多线程套间 (MTA) 中创建，接口指针可以跨 MTA 线程使用；
    // 所有访问都经过 ConnectionManager 的互斥锁
    unsafe impl Send for WmiSession {}
    unsafe impl Sync for WmiSession {}

    impl WmiSession {
        /// 连接到 ROOT\CIMV2
        fn connect() -> Result<Self> {
            unsafe {
                let locator: IWbemLocator =
                    CoCreateInstance(&WbemLocator, None, CLSCTX_INPROC_SERVER)
                        .map_err(|e| wmi_error("创建 WbemLocator 失败", e))?;

                let services = locator
                    .ConnectServer(
                        &BSTR::from("ROOT\\CIMV2"),
                        &BSTR::new(),
                        &BSTR::new(),
                        &BSTR::new(),
                        0,
                        &BSTR::new(),
                        None,
                    )
                    .map_err(|e| wmi_error("连接 ROOT\\CIMV2 失败", e))?;

                CoSetProxyBlanket(
                    &services,
                    RPC_C_AUTHN_DEFAULT,
                    RPC_C_AUTHZ_NONE,
                    None,
                    RPC_C_AUTHN_LEVEL_CALL,
                    RPC_C_IMP_LEVEL_IMPERSONATE,
                    None,
                    EOAC_NONE,
                )
                .map_err(|e| wmi_error("设置代理安全失败", e))?;

                Ok(Self { services })
            }
        }

        fn query(&self, wql: &str) -> Result<WmiQueryResult> {
            unsafe {
                let enumerator = self
                    .services
                    .ExecQuery(
                        &BSTR::from("WQL"),
                        &BSTR::from(wql),
                        WBEM_FLAG_FORWARD_ONLY | WBEM_FLAG_RETURN_IMMEDIATELY,
                        None,
                    )
                    .map_err(|e| wmi_error("执行 WQL 查询失败", e))?;

                Ok(WmiQueryResult { enumerator })
            }
        }
    }

    impl AdapterSession for WmiSession {
        fn physical_adapters(&self) -> Result<Vec<WmiAdapterRecord>> {
            let records = self
                .query(ADAPTER_QUERY)?
                .map(|obj| WmiAdapterRecord {
                    name: obj.get_string("Name"),
                    device_id: obj.get_string("DeviceID"),
                    mac_address: obj.get_string("MACAddress"),
                    net_connection_id: obj.get_string("NetConnectionID"),
                    net_connection_status: obj.get_u32("NetConnectionStatus"),
                    physical: true,
                })
                .collect();
            Ok(records)
        }
    }

    fn wmi_error(context: &str, e: windows::core::Error) -> EngineError {
        EngineError::ConnectionFailed {
            attempts: 1,
            reason: format!("{}: {}", context, e),
        }
    }

    /// WMI 查询结果迭代器
    struct WmiQueryResult {
        enumerator: IEnumWbemClassObject,
    }

    impl Iterator for WmiQueryResult {
        type Item = WmiObject;

        fn next(&mut self) -> Option<Self::Item> {
            unsafe {
                let mut objects: [Option<IWbemClassObject>; 1] = [None];
                let mut returned: u32 = 0;

                // 5秒超时，避免无限等待
                let result = self.enumerator.Next(5000, &mut objects, &mut returned);

                if result.is_ok() && returned > 0 {
                    objects[0].take().map(|inner| WmiObject { inner })
                } else {
                    None
                }
            }
        }
    }

    struct WmiObject {
        inner: IWbemClassObject,
    }

    impl WmiObject {
        fn get(&self, property: &str) -> Option<VARIANT> {
            unsafe {
                let prop_name = BSTR::from(property);
                let mut value = VARIANT::default();
                self.inner
                    .Get(&prop_name, 0, &mut value, None, None)
                    .ok()
                    .map(|_| value)
            }
        }

        fn get_string(&self, property: &str) -> Option<String> {
            let value = self.get(property)?;
            if variant_vt(&value) != VT_BSTR {
                return None;
            }
            BSTR::try_from(&value)
                .ok()
                .map(|b| b.to_string())
                .filter(|s| !s.trim().is_empty())
        }

        fn get_u32(&self, property: &str) -> Option<u32> {
            let value = self.get(property)?;
            let vt = variant_vt(&value);
            if vt == VT_NULL || vt == VT_EMPTY {
                None
            } else if vt == VT_I4 {
                i32::try_from(&value).ok().map(|v| v as u32)
            } else if vt == VT_UI4 {
                u32::try_from(&value).ok()
            } else if vt == VT_I2 {
                i16::try_from(&value).ok().map(|v| v as u32)
            } else if vt == VT_UI2 {
                u16::try_from(&value).ok().map(u32::from)
            } else {
                None
            }
        }
    }

    /// 读取 VARIANT 的类型标记（结构前 2 字节）
    #[inline]
    fn variant_vt(var: &VARIANT) -> VARENUM {
        unsafe {
            let var_ptr = var as *const VARIANT as *const u16;
            VARENUM(*var_ptr)
        }
    }

    /// 基于 COM 的会话工厂
    #[derive(Debug, Default)]
    pub struct WmiSessionFactory;

    impl SessionFactory for WmiSessionFactory {
        type Session = WmiSession;

        fn register_thread(&self) -> bool {
            if COM_REGISTERED.with(|r| r.get()) {
                return false;
            }

            // RPC_E_CHANGED_MODE 表示线程已以其他模式初始化，忽略即可
            let initialized = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED).is_ok() };
            if !initialized {
                log::debug!("当前线程 COM 已初始化，跳过");
                return false;
            }

            SECURITY_INIT.call_once(|| {
                let _ = unsafe {
                    CoInitializeSecurity(
                        None,
                        -1,
                        None,
                        None,
                        RPC_C_AUTHN_LEVEL_DEFAULT,
                        RPC_C_IMP_LEVEL_IMPERSONATE,
                        None,
                        EOAC_NONE,
                        None,
                    )
                };
            });

            COM_REGISTERED.with(|r| r.set(true));
            true
        }

        fn unregister_thread(&self) {
            if COM_REGISTERED.with(|r| r.replace(false)) {
                unsafe { CoUninitialize() };
            }
        }

        fn open(&self) -> Result<WmiSession> {
            WmiSession::connect()
        }
    }
}

#[cfg(not(windows))]
mod unsupported {
    use super::{AdapterSession, SessionFactory, WmiAdapterRecord};
    use crate::core::error::{EngineError, Result};

    /// 非 Windows 平台的占位会话
    pub struct WmiSession;

    impl AdapterSession for WmiSession {
        fn physical_adapters(&self) -> Result<Vec<WmiAdapterRecord>> {
            Err(EngineError::Unsupported("WMI".to_string()))
        }
    }

    #[derive(Debug, Default)]
    pub struct WmiSessionFactory;

    impl SessionFactory for WmiSessionFactory {
        type Session = WmiSession;

        fn open(&self) -> Result<WmiSession> {
            Err(EngineError::Unsupported("WMI".to_string()))
        }
    }
}
