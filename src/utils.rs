/// 工具函数模块
///
/// 日志初始化、本地地址探测和各类标识生成
use rand::Rng;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::Level;
use uuid::Uuid;

/// 初始化日志
///
/// `level` 无法识别时回退到 info
pub fn initialize_logging(level: &str) {
    let level = Level::from_str(level.trim()).unwrap_or(Level::INFO);
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init();
}

/// 获取第一个非回环的网络接口 IP 地址
///
/// 遍历系统所有网络接口，返回第一个非回环的 IPv4 地址
///
/// # 示例
/// ```rust,no_run
/// use sip_presence_publisher::utils::get_first_non_loopback_interface;
///
/// let local_ip = get_first_non_loopback_interface().unwrap();
/// println!("本地IP: {}", local_ip);
/// ```
pub fn get_first_non_loopback_interface() -> Result<IpAddr, Box<dyn std::error::Error>> {
    for interface in get_if_addrs::get_if_addrs()? {
        if !interface.is_loopback() {
            match interface.addr {
                get_if_addrs::IfAddr::V4(ref addr) => return Ok(IpAddr::V4(addr.ip)),
                _ => continue,
            }
        }
    }
    Err("未找到 IPv4 接口".into())
}

/// 生成基于 UUID 的 Call-ID
///
/// ```rust
/// use sip_presence_publisher::utils::make_call_id;
///
/// let call_id = make_call_id(Some("example.com"));
/// // 生成类似: "550e8400-e29b-41d4-a716-446655440000@example.com"
/// ```
pub fn make_call_id(domain: Option<&str>) -> rsip::headers::CallId {
    let uuid = Uuid::new_v4();

    match domain {
        Some(d) => format!("{}@{}", uuid, d).into(),
        None => uuid.to_string().into(),
    }
}

/// 出席文档元素 id：8 个小写字母
pub fn random_element_id() -> String {
    random_element_id_with(&mut rand::rng())
}

pub fn random_element_id_with<R: Rng>(rng: &mut R) -> String {
    (0..8)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}
