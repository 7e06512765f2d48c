//! Windows 网卡速度与双工模式设置引擎

pub mod core;
pub mod utils;
