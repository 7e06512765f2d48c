use encoding_rs::GBK;

/// 将 GBK 编码的字节转换为 UTF-8 字符串
pub fn gbk_to_utf8(bytes: &[u8]) -> String {
    let (cow, _, _) = GBK.decode(bytes);
    cow.into_owned()
}

/// 解码控制台输出
///
/// PowerShell 的输出编码取决于控制台代码页：合法 UTF-8 直接使用，
/// 否则按中文系统默认的 GBK 解码
pub fn decode_console_output(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => gbk_to_utf8(bytes),
    }
}
