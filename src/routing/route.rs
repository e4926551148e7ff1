/// 路由数据模型
///
/// DNS 解析得到的候选代理地址，按偏好顺序排列
use std::collections::VecDeque;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::error::ConfigError;

/// 解析结果的有效期
pub const BATCH_VALIDITY: Duration = Duration::from_secs(30);

/// SIP 传输协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Transport::Tls => 5061,
            _ => 5060,
        }
    }

    /// SRV 记录名前缀，例如 `_sip._udp`
    pub fn srv_prefix(&self) -> &'static str {
        match self {
            Transport::Udp => "_sip._udp",
            Transport::Tcp => "_sip._tcp",
            Transport::Tls => "_sips._tcp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            other => Err(ConfigError::Parse(format!("unsupported transport: {}", other))),
        }
    }
}

impl From<Transport> for rsip::transport::Transport {
    fn from(transport: Transport) -> Self {
        match transport {
            Transport::Udp => rsip::transport::Transport::Udp,
            Transport::Tcp => rsip::transport::Transport::Tcp,
            Transport::Tls => rsip::transport::Transport::Tls,
        }
    }
}

/// 一个可达的 SIP 服务器地址
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub address: String,
    pub port: u16,
    pub transport: Transport,
}

impl Route {
    pub fn new(address: impl Into<String>, port: u16, transport: Transport) -> Self {
        Self {
            address: address.into(),
            port,
            transport,
        }
    }

    /// `host:port`，IPv6 地址加方括号
    pub fn host_port(&self) -> String {
        match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.address, self.port),
            _ => format!("{}:{}", self.address, self.port),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};transport={}", self.host_port(), self.transport)
    }
}

/// 一次解析的结果：有序路由 + 过期时间
#[derive(Debug, Clone)]
pub struct ResolutionBatch {
    routes: Vec<Route>,
    valid_until: Instant,
}

impl ResolutionBatch {
    pub fn new(routes: Vec<Route>, valid_until: Instant) -> Self {
        Self { routes, valid_until }
    }

    /// 以 `resolved_at` 为起点，有效期 30 秒
    pub fn resolved_at(routes: Vec<Route>, resolved_at: Instant) -> Self {
        Self::new(routes, resolved_at + BATCH_VALIDITY)
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn valid_until(&self) -> Instant {
        self.valid_until
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now <= self.valid_until
    }

    pub fn into_queue(self) -> VecDeque<Route> {
        self.routes.into()
    }
}

/// 解析目标：显式的 outbound 代理或账户域名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveTarget {
    pub host: String,
    pub port: Option<u16>,
    pub transport: Option<Transport>,
}

impl ResolveTarget {
    pub fn domain(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            transport: None,
        }
    }

    /// 解析 `host[:port][;transport=x]`，可带 `sip:` 前缀
    pub fn parse_proxy(value: &str) -> Result<Self, ConfigError> {
        let value = value.trim();
        let value = value
            .strip_prefix("sip:")
            .or_else(|| value.strip_prefix("sips:"))
            .unwrap_or(value);

        let mut parts = value.split(';');
        let host_port = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::Invalid(format!("empty outbound proxy: {}", value)))?;

        let mut transport = None;
        for param in parts {
            if let Some(t) = param.trim().strip_prefix("transport=") {
                transport = Some(t.parse()?);
            }
        }

        let (host, port) = split_host_port(host_port)?;
        Ok(Self {
            host,
            port,
            transport,
        })
    }
}

impl fmt::Display for ResolveTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sip:{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(transport) = self.transport {
            write!(f, ";transport={}", transport)?;
        }
        Ok(())
    }
}

fn split_host_port(value: &str) -> Result<(String, Option<u16>), ConfigError> {
    // [v6]:port
    if let Some(rest) = value.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ConfigError::Invalid(format!("unterminated IPv6 host: {}", value)))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None => None,
        };
        return Ok((host.to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => Ok((host.to_string(), Some(parse_port(port)?))),
        _ => Ok((value.to_string(), None)),
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    value
        .parse::<u16>()
        .map_err(|_| ConfigError::Parse(format!("invalid port: {}", value)))
}
