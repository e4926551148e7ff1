// 声明所有模块
pub mod backoff;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod presence;
pub mod publication;
pub mod routing;
pub mod sip_client;
pub mod sip_publication;
pub mod utils;

/// 重新导出thiserror错误类型
pub use crate::error::{ConfigError, DnsError, DocumentError, PublishError, PublishResult};

/// 主要API重新导出，简化使用
pub use crate::config::{AccountConfig, Config};
pub use crate::controller::{ControllerConfig, ControllerHandle, PublishController, RetryPolicy};
pub use crate::diagnostics::DiagnosticFlags;
pub use crate::presence::{FortuneNoteSource, PresenceDocument, PresenceMutator};
pub use crate::publication::{Credentials, Publisher};
pub use crate::routing::{DnsRouteResolver, ResolveTarget, Route, RouteResolver, Transport};
pub use crate::sip_client::{SipClient, SipClientConfig};

use chrono::Local;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::info;

/// 库的版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 默认 User-Agent
pub fn default_user_agent() -> String {
    format!("sip-auto-publish/{}", VERSION)
}

/// 便捷函数：为选中的账户创建完整的发布控制器
///
/// 使用系统 DNS 配置、`fortune` 便签和绑定在本地接口上的 SIP 客户端
pub async fn create_publisher(
    config: &Config,
    account: Option<&str>,
) -> Result<
    (
        PublishController<StdRng, FortuneNoteSource>,
        Arc<SipClient>,
    ),
    Box<dyn std::error::Error>,
> {
    let account = config.select_account(account)?.clone();
    let flags = Arc::new(DiagnosticFlags::new(
        config.trace_sip,
        config.trace_notifications,
    ));

    let client_config = SipClientConfig {
        user_agent: config.user_agent.clone(),
        ..Default::default()
    };
    let client = Arc::new(SipClient::new(client_config, flags.clone()).await?);
    for addr in client.local_addrs() {
        info!("SIP 本地地址: {}", addr);
    }

    let document = PresenceDocument::new(
        &account.id(),
        &config.user_agent,
        Local::now().fixed_offset(),
    );
    let mutator = PresenceMutator::new(StdRng::from_os_rng());

    let controller = PublishController::new(
        config.controller_config(&account),
        Arc::new(DnsRouteResolver::from_system()),
        client.clone(),
        document,
        mutator,
        FortuneNoteSource::default(),
        flags,
    );
    Ok((controller, client))
}
