/// Routing 模块
///
/// 把 outbound 代理或账户域名解析为有序的候选路由
///
/// - `RouteResolver` trait: 解析行为接口
/// - `DnsRouteResolver`: 基于 DNS SRV / A / AAAA 的实现
/// - `StaticRouteResolver`: 返回预设结果
///
/// ```rust,ignore
/// use sip_presence_publisher::routing::*;
///
/// let resolver = DnsRouteResolver::from_system();
/// let target = ResolveTarget::domain("example.com");
/// let batch = resolver.resolve(&target, &[Transport::Udp, Transport::Tcp]).await?;
/// ```

mod resolver;
mod route;

pub use resolver::{DnsRouteResolver, RouteResolver, StaticRouteResolver};
pub use route::{ResolutionBatch, ResolveTarget, Route, Transport, BATCH_VALIDITY};
