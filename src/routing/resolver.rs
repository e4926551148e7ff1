/// SIP 代理地址解析
///
/// 通过 DNS SRV / A / AAAA 查找候选服务器，按偏好顺序返回
use async_trait::async_trait;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info};
use trust_dns_resolver::{
    config::{ResolverConfig, ResolverOpts},
    TokioAsyncResolver,
};

use super::route::{ResolutionBatch, ResolveTarget, Route, Transport};
use crate::error::DnsError;

/// 路由解析器 trait
#[async_trait]
pub trait RouteResolver: Send + Sync {
    /// 解析目标，返回非空的有序路由批次
    ///
    /// # 参数
    /// - `target`: outbound 代理或账户域名
    /// - `transports`: 本地启用的传输协议（按偏好排序）
    async fn resolve(
        &self,
        target: &ResolveTarget,
        transports: &[Transport],
    ) -> Result<ResolutionBatch, DnsError>;
}

/// 基于系统 DNS 配置的解析器
#[derive(Clone)]
pub struct DnsRouteResolver {
    resolver: TokioAsyncResolver,
}

impl DnsRouteResolver {
    /// 使用 /etc/resolv.conf，失败时退回默认配置
    pub fn from_system() -> Self {
        match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Self { resolver },
            Err(e) => {
                debug!("读取系统 DNS 配置失败，使用默认配置: {}", e);
                Self::with_config(ResolverConfig::default(), ResolverOpts::default())
            }
        }
    }

    /// 指定上游服务器和选项
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }

    async fn resolve_routes(
        &self,
        target: &ResolveTarget,
        transports: &[Transport],
    ) -> Result<Vec<Route>, DnsError> {
        let allowed = allowed_transports(target, transports)?;
        let host = target.host.as_str();

        if host.parse::<IpAddr>().is_ok() {
            return Ok(allowed
                .iter()
                .map(|t| Route::new(host, target.port.unwrap_or(t.default_port()), *t))
                .collect());
        }

        // 显式端口：跳过 SRV
        if let Some(port) = target.port {
            let ips = self.lookup_ips(host).await?;
            return Ok(expand(&ips, &allowed, |_| port));
        }

        let mut routes = Vec::new();
        for transport in &allowed {
            match self.lookup_srv(host, *transport).await {
                Ok(found) => routes.extend(found),
                Err(e) => debug!("SRV lookup {}.{} failed: {}", transport.srv_prefix(), host, e),
            }
        }

        if routes.is_empty() {
            let ips = self.lookup_ips(host).await?;
            routes = expand(&ips, &allowed, |t| t.default_port());
        }
        Ok(routes)
    }

    async fn lookup_srv(&self, host: &str, transport: Transport) -> Result<Vec<Route>, DnsError> {
        let name = format!("{}.{}.", transport.srv_prefix(), host.trim_end_matches('.'));
        let lookup = self.resolver.srv_lookup(name).await?;

        let mut groups: BTreeMap<u16, Vec<(u16, String, u16)>> = BTreeMap::new();
        for srv in lookup.iter() {
            let target = srv.target().to_utf8();
            groups.entry(srv.priority()).or_default().push((
                srv.weight(),
                target.trim_end_matches('.').to_string(),
                srv.port(),
            ));
        }

        let mut routes = Vec::new();
        for (_, records) in groups {
            for (target, port) in select_by_weight(records) {
                match self.lookup_ips(&target).await {
                    Ok(ips) => {
                        routes.extend(ips.into_iter().map(|ip| Route::new(ip.to_string(), port, transport)))
                    }
                    Err(e) => debug!("SRV target {} did not resolve: {}", target, e),
                }
            }
        }

        if routes.is_empty() {
            Err(DnsError::NxDomain(host.to_string()))
        } else {
            Ok(routes)
        }
    }

    /// IPv4 在前：本地传输只绑定 IPv4
    async fn lookup_ips(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        let lookup = self.resolver.lookup_ip(host).await?;
        let (mut v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = lookup.iter().partition(|ip| ip.is_ipv4());
        v4.extend(v6);
        if v4.is_empty() {
            Err(DnsError::NxDomain(host.to_string()))
        } else {
            Ok(v4)
        }
    }
}

#[async_trait]
impl RouteResolver for DnsRouteResolver {
    async fn resolve(
        &self,
        target: &ResolveTarget,
        transports: &[Transport],
    ) -> Result<ResolutionBatch, DnsError> {
        let routes = self.resolve_routes(target, transports).await?;
        if routes.is_empty() {
            return Err(DnsError::NxDomain(target.host.clone()));
        }
        info!("解析 {} 得到 {} 条路由", target, routes.len());
        Ok(ResolutionBatch::resolved_at(routes, Instant::now()))
    }
}

/// 目标显式指定的传输必须在本地启用列表中
fn allowed_transports(
    target: &ResolveTarget,
    transports: &[Transport],
) -> Result<Vec<Transport>, DnsError> {
    let allowed: Vec<Transport> = match target.transport {
        Some(t) if transports.contains(&t) => vec![t],
        Some(_) => Vec::new(),
        None => transports.to_vec(),
    };
    if allowed.is_empty() {
        Err(DnsError::NoUsableTransport(target.to_string()))
    } else {
        Ok(allowed)
    }
}

fn expand(ips: &[IpAddr], transports: &[Transport], port: impl Fn(Transport) -> u16) -> Vec<Route> {
    transports
        .iter()
        .flat_map(|t| ips.iter().map(move |ip| (ip, *t)))
        .map(|(ip, t)| Route::new(ip.to_string(), port(t), t))
        .collect()
}

/// RFC 2782 同优先级内按权重随机排序
fn select_by_weight(mut records: Vec<(u16, String, u16)>) -> Vec<(String, u16)> {
    let mut rng = rand::rng();
    let mut result = Vec::with_capacity(records.len());

    while !records.is_empty() {
        let total: u32 = records.iter().map(|(w, _, _)| *w as u32).sum();
        let idx = if total == 0 {
            rng.random_range(0..records.len())
        } else {
            let pick = rng.random_range(0..total);
            let mut cumulative = 0u32;
            records
                .iter()
                .position(|(w, _, _)| {
                    cumulative += *w as u32;
                    cumulative > pick
                })
                .unwrap_or(0)
        };
        let (_, host, port) = records.remove(idx);
        result.push((host, port));
    }
    result
}

/// 返回预设结果的解析器（测试与静态部署用）
///
/// 按调用顺序依次返回脚本中的结果，脚本用完后重复最后一个结果。
pub struct StaticRouteResolver {
    script: Mutex<VecDeque<Result<Vec<Route>, DnsError>>>,
    last: Mutex<Option<Result<Vec<Route>, DnsError>>>,
    calls: Mutex<usize>,
}

impl StaticRouteResolver {
    pub fn new(routes: Vec<Route>) -> Self {
        Self::scripted(vec![Ok(routes)])
    }

    pub fn scripted(results: Vec<Result<Vec<Route>, DnsError>>) -> Self {
        Self {
            script: Mutex::new(results.into()),
            last: Mutex::new(None),
            calls: Mutex::new(0),
        }
    }

    /// 已被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or(0)
    }

    fn next_result(&self) -> Result<Vec<Route>, DnsError> {
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let mut last = match self.last.lock() {
            Ok(last) => last,
            Err(_) => return Err(DnsError::Lookup("resolver state poisoned".to_string())),
        };
        if let Some(result) = next {
            *last = Some(result);
        }
        last.clone()
            .unwrap_or_else(|| Err(DnsError::Lookup("no scripted result".to_string())))
    }
}

#[async_trait]
impl RouteResolver for StaticRouteResolver {
    async fn resolve(
        &self,
        target: &ResolveTarget,
        transports: &[Transport],
    ) -> Result<ResolutionBatch, DnsError> {
        let routes: Vec<Route> = self
            .next_result()?
            .into_iter()
            .filter(|r| transports.contains(&r.transport))
            .collect();
        if routes.is_empty() {
            return Err(DnsError::NoUsableTransport(target.to_string()));
        }
        Ok(ResolutionBatch::resolved_at(routes, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_resolver_rejects_disabled_proxy_transport() {
        let resolver = DnsRouteResolver::with_config(ResolverConfig::default(), ResolverOpts::default());
        let target = ResolveTarget::parse_proxy("192.0.2.1;transport=tls").unwrap();
        let err = resolver
            .resolve(&target, &[Transport::Udp, Transport::Tcp])
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::NoUsableTransport(_)));
    }

    #[test]
    fn test_explicit_transport_must_be_enabled() {
        let target = ResolveTarget::parse_proxy("proxy.example.com;transport=tls").unwrap();
        let err = allowed_transports(&target, &[Transport::Udp, Transport::Tcp]).unwrap_err();
        assert!(matches!(err, DnsError::NoUsableTransport(_)));

        let allowed = allowed_transports(&target, &[Transport::Tls]).unwrap();
        assert_eq!(allowed, vec![Transport::Tls]);
    }

    #[test]
    fn test_domain_uses_all_enabled_transports() {
        let target = ResolveTarget::domain("example.com");
        let allowed = allowed_transports(&target, &[Transport::Tcp, Transport::Udp]).unwrap();
        assert_eq!(allowed, vec![Transport::Tcp, Transport::Udp]);
        assert!(allowed_transports(&target, &[]).is_err());
    }

    #[tokio::test]
    async fn test_numeric_host_skips_dns() {
        let resolver = DnsRouteResolver::from_system();
        let target = ResolveTarget::parse_proxy("192.0.2.10").unwrap();
        let batch = resolver
            .resolve(&target, &[Transport::Udp, Transport::Tcp])
            .await
            .unwrap();
        assert_eq!(
            batch.routes(),
            &[
                Route::new("192.0.2.10", 5060, Transport::Udp),
                Route::new("192.0.2.10", 5060, Transport::Tcp),
            ]
        );
    }

    #[test]
    fn test_weight_selection_keeps_all_records() {
        let records = vec![
            (0, "a".to_string(), 5060),
            (10, "b".to_string(), 5060),
            (0, "c".to_string(), 5062),
        ];
        let mut result = select_by_weight(records);
        result.sort();
        assert_eq!(result.len(), 3);
        assert_eq!(result[2], ("c".to_string(), 5062));
    }

    #[tokio::test]
    async fn test_static_resolver_script_repeats_last() {
        let resolver = StaticRouteResolver::scripted(vec![
            Err(DnsError::Timeout),
            Ok(vec![Route::new("10.0.0.1", 5060, Transport::Udp)]),
        ]);
        let target = ResolveTarget::domain("example.com");
        assert_eq!(
            resolver.resolve(&target, &[Transport::Udp]).await.unwrap_err(),
            DnsError::Timeout
        );
        assert_eq!(resolver.resolve(&target, &[Transport::Udp]).await.unwrap().routes().len(), 1);
        assert_eq!(resolver.resolve(&target, &[Transport::Udp]).await.unwrap().routes().len(), 1);
        assert_eq!(resolver.calls(), 3);
    }
}
