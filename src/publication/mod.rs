/// Publication 模块
///
/// - `Publisher` trait: 发送 PUBLISH 的接口（`SipClient` 实现）
/// - `PublicationSession`: 绑定单条路由的一次发布尝试
///
/// ```rust,ignore
/// use sip_presence_publisher::publication::*;
///
/// let mut session = PublicationSession::new(id, publisher, "alice@example.com", credentials, route, 600);
/// let transition = session.start(pidf_bytes).await;
/// if transition.state == SessionState::Published {
///     session.stop().await;
/// }
/// ```

mod session;
mod traits;

pub use session::{
    PublicationSession, SessionHandle, SessionId, SessionReport, SessionState, SessionTransition,
};
pub use traits::{Credentials, PublishRequest, PublishResponse, Publisher, PRESENCE_EVENT};
