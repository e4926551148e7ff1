/// SIP 客户端核心模块
///
/// 封装 rsipstack Endpoint，为每条路由发送 PUBLISH
use async_trait::async_trait;
use rsipstack::{
    dialog::authenticate::Credential,
    transaction::{Endpoint, TransactionReceiver},
    transport::{udp::UdpConnection, SipAddr, TransportLayer},
    EndpointBuilder,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::diagnostics::DiagnosticFlags;
use crate::error::{PublishError, PublishResult};
use crate::publication::{PublishRequest, PublishResponse, Publisher};
use crate::routing::{Route, Transport};
use crate::sip_publication::{parse_response, Publication};

/// SIP 客户端配置
#[derive(Debug, Clone)]
pub struct SipClientConfig {
    /// User-Agent字符串
    pub user_agent: String,

    /// 单次事务超时
    pub transaction_timeout: Duration,
}

impl Default for SipClientConfig {
    fn default() -> Self {
        Self {
            user_agent: crate::default_user_agent(),
            transaction_timeout: Duration::from_secs(32),
        }
    }
}

/// SIP 客户端
pub struct SipClient {
    config: SipClientConfig,
    endpoint: Endpoint,
    flags: Arc<DiagnosticFlags>,
    cancel_token: CancellationToken,
}

impl SipClient {
    /// 创建新的SIP客户端
    ///
    /// 在第一个非回环接口上绑定 UDP；TCP 连接在发送时按需建立
    pub async fn new(config: SipClientConfig, flags: Arc<DiagnosticFlags>) -> PublishResult<Self> {
        let cancel_token = CancellationToken::new();

        let local_ip = crate::utils::get_first_non_loopback_interface()
            .map_err(|e| PublishError::transport(e.to_string()))?;
        info!(
            "检测到本地出口IP: {} ({})",
            local_ip,
            if local_ip.is_ipv6() { "IPv6" } else { "IPv4" }
        );

        let transport_layer = TransportLayer::new(cancel_token.clone());
        let local_addr = std::net::SocketAddr::new(local_ip, 0);
        let connection =
            UdpConnection::create_connection(local_addr, None, Some(cancel_token.child_token()))
                .await?;
        transport_layer.add_transport(connection.into());

        let mut endpoint_builder = EndpointBuilder::new();
        endpoint_builder
            .with_cancel_token(cancel_token.clone())
            .with_transport_layer(transport_layer)
            .with_user_agent(&config.user_agent);
        let endpoint = endpoint_builder.build();

        let endpoint_for_serve = endpoint.inner.clone();
        tokio::spawn(async move {
            endpoint_for_serve.serve().await.ok();
        });

        Self::start_incoming_handler(
            endpoint.incoming_transactions()?,
            flags.clone(),
            cancel_token.clone(),
        );

        Ok(Self {
            config,
            endpoint,
            flags,
            cancel_token,
        })
    }

    /// 本地绑定地址
    pub fn local_addrs(&self) -> Vec<SipAddr> {
        self.endpoint.get_addrs()
    }

    /// 启动传入请求处理器
    ///
    /// 发布方不接受任何请求，一律回复 405
    fn start_incoming_handler(
        mut incoming: TransactionReceiver,
        flags: Arc<DiagnosticFlags>,
        cancel_token: CancellationToken,
    ) {
        tokio::spawn(async move {
            while let Some(mut transaction) = tokio::select! {
                tx = incoming.recv() => tx,
                _ = cancel_token.cancelled() => None,
            } {
                let method = transaction.original.method;
                if flags.trace_notifications() {
                    info!("收到传入请求: {}\n{}", method, transaction.original);
                } else {
                    debug!("收到传入请求: {}", method);
                }

                tokio::spawn(async move {
                    if let Err(e) = transaction.reply(rsip::StatusCode::MethodNotAllowed).await {
                        warn!("回复 {} 请求失败: {}", method, e);
                    }
                });
            }
        });
    }

    fn destination(route: &Route) -> PublishResult<SipAddr> {
        let ip: std::net::IpAddr = route
            .address
            .parse()
            .map_err(|_| PublishError::InvalidUri(format!("route address {}", route.address)))?;
        Ok(SipAddr {
            r#type: Some(route.transport.into()),
            addr: std::net::SocketAddr::new(ip, route.port).into(),
        })
    }

    async fn send(&self, request: &PublishRequest) -> PublishResult<PublishResponse> {
        if request.route.transport == Transport::Tls {
            return Err(PublishError::transport(format!(
                "transport {} is not available",
                request.route.transport
            )));
        }
        let destination = Self::destination(&request.route)?;

        let credential = Credential {
            username: request.credentials.username.clone(),
            password: request.credentials.password.clone(),
            realm: request.credentials.realm.clone(),
        };
        let mut publication = Publication::new(self.endpoint.inner.clone(), Some(credential))
            .with_trace(self.flags.trace_sip());

        let resp = tokio::time::timeout(
            self.config.transaction_timeout,
            publication.publish(request, destination),
        )
        .await??;
        Ok(parse_response(&resp))
    }

    /// 关闭客户端
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

#[async_trait]
impl Publisher for SipClient {
    async fn publish(&self, request: &PublishRequest) -> PublishResult<PublishResponse> {
        self.send(request).await
    }
}
