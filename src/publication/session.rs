/// 单次发布会话
///
/// 一个会话绑定一条路由，只发出一次 PUBLISH；失败后由控制器新建会话重试
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use super::traits::{Credentials, PublishRequest, PublishResponse, Publisher};
use crate::error::{is_auth_failure, PublishError, PublishResult};
use crate::routing::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 已创建，尚未发送
    New,
    Publishing,
    Published,
    /// 终态
    Unpublished,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Unpublished)
    }
}

/// 状态变化通知
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTransition {
    pub state: SessionState,
    /// 传输错误时为 None
    pub code: Option<u16>,
    pub reason: String,
}

impl SessionTransition {
    pub fn is_auth_failure(&self) -> bool {
        self.code.map(is_auth_failure).unwrap_or(false)
    }

    pub fn is_success_code(&self) -> bool {
        self.code.map(|c| (200..300).contains(&c)).unwrap_or(false)
    }
}

pub struct PublicationSession {
    id: SessionId,
    publisher: Arc<dyn Publisher>,
    aor: String,
    credentials: Credentials,
    route: Route,
    expires: u32,
    state: SessionState,
    etag: Option<String>,
    request: Option<PublishRequest>,
}

impl PublicationSession {
    pub fn new(
        id: SessionId,
        publisher: Arc<dyn Publisher>,
        aor: impl Into<String>,
        credentials: Credentials,
        route: Route,
        expires: u32,
    ) -> Self {
        Self {
            id,
            publisher,
            aor: aor.into(),
            credentials,
            route,
            expires,
            state: SessionState::New,
            etag: None,
            request: None,
        }
    }

    /// 沿用上一个会话在服务器上的实体标签，使本次发布成为刷新而非新建
    pub fn with_entity_tag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn entity_tag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// 发送一次 PUBLISH
    pub async fn start(&mut self, body: Vec<u8>) -> SessionTransition {
        if self.state != SessionState::New {
            warn!("会话 {} 已启动，忽略重复 start", self.id);
            return SessionTransition {
                state: self.state,
                code: None,
                reason: "session already started".to_string(),
            };
        }

        self.state = SessionState::Publishing;
        let request = PublishRequest::presence(
            self.aor.clone(),
            self.credentials.clone(),
            self.route.clone(),
            body,
            self.expires,
        )
        .with_if_match(self.etag.clone());

        debug!("会话 {} 发布到 {}", self.id, self.route);
        let transition = match self.call(&request).await {
            Err(e) => {
                self.state = SessionState::Unpublished;
                self.panicked("发布", e)
            }
            Ok(Ok(response)) if response.is_success() => {
                if response.etag.is_some() {
                    self.etag = response.etag.clone();
                }
                self.state = SessionState::Published;
                SessionTransition {
                    state: SessionState::Published,
                    code: Some(response.code),
                    reason: response.reason,
                }
            }
            Ok(Ok(response)) => {
                self.state = SessionState::Unpublished;
                SessionTransition {
                    state: SessionState::Unpublished,
                    code: Some(response.code),
                    reason: response.reason,
                }
            }
            Ok(Err(e)) => {
                self.state = SessionState::Unpublished;
                self.failed("发布", e)
            }
        };
        self.request = Some(request);
        transition
    }

    /// 已发布时删除发布；其他状态无操作
    pub async fn stop(&mut self) -> Option<SessionTransition> {
        match self.state {
            SessionState::Published => {}
            SessionState::New => {
                self.state = SessionState::Unpublished;
                return None;
            }
            _ => return None,
        }

        let request = self.request.as_ref()?.removal(self.etag.clone());
        self.state = SessionState::Unpublished;
        info!("会话 {} 删除发布: {}", self.id, self.route);

        let transition = match self.call(&request).await {
            Ok(Ok(response)) => SessionTransition {
                state: SessionState::Unpublished,
                code: Some(response.code),
                reason: response.reason,
            },
            Ok(Err(e)) => self.failed("删除发布", e),
            Err(e) => self.panicked("删除发布", e),
        };
        Some(transition)
    }

    /// 在独立任务中调用发送方，发送方 panic 时返回 JoinError 而不是拖垮会话
    async fn call(
        &self,
        request: &PublishRequest,
    ) -> Result<PublishResult<PublishResponse>, JoinError> {
        let publisher = self.publisher.clone();
        let request = request.clone();
        tokio::spawn(async move {
            if request.is_removal() {
                publisher.unpublish(&request).await
            } else {
                publisher.publish(&request).await
            }
        })
        .await
    }

    fn failed(&self, action: &str, e: PublishError) -> SessionTransition {
        if e.is_recoverable() {
            warn!("会话 {} {}失败 [{}]: {}", self.id, action, e.error_code(), e);
        } else {
            error!("会话 {} {}失败 [{}]: {}", self.id, action, e.error_code(), e);
        }
        SessionTransition {
            state: SessionState::Unpublished,
            code: e.sip_status_code(),
            reason: e.to_string(),
        }
    }

    /// 按传输错误处理：无状态码，控制器会轮换或退避
    fn panicked(&self, action: &str, e: JoinError) -> SessionTransition {
        error!("会话 {} {}时发送方异常退出: {}", self.id, action, e);
        SessionTransition {
            state: SessionState::Unpublished,
            code: None,
            reason: format!("publisher task failed: {}", e),
        }
    }

    /// 在后台任务中运行会话
    ///
    /// 发布结果通过 `report` 回调通知；发布成功后等待 `SessionHandle::unpublish`，
    /// 句柄被丢弃时任务结束且不删除发布。
    pub fn spawn<F>(mut self, body: Vec<u8>, report: F) -> SessionHandle
    where
        F: Fn(SessionReport) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionCommand>();
        let id = self.id;
        let route = self.route.clone();

        tokio::spawn(async move {
            let transition = self.start(body).await;
            report(SessionReport {
                id: self.id,
                route: self.route.clone(),
                etag: self.etag.clone(),
                transition,
            });

            while !self.state.is_terminal() {
                match rx.recv().await {
                    Some(SessionCommand::Unpublish) => {
                        if let Some(transition) = self.stop().await {
                            report(SessionReport {
                                id: self.id,
                                route: self.route.clone(),
                                etag: None,
                                transition,
                            });
                        }
                    }
                    None => break,
                }
            }
        });

        SessionHandle { id, route, tx }
    }
}

#[derive(Debug)]
enum SessionCommand {
    Unpublish,
}

/// 后台会话发出的状态报告
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: SessionId,
    pub route: Route,
    pub etag: Option<String>,
    pub transition: SessionTransition,
}

/// 后台会话句柄
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    route: Route,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// 请求删除发布；会话已结束时无操作
    pub fn unpublish(&self) {
        if self.tx.send(SessionCommand::Unpublish).is_err() {
            debug!("会话 {} 已结束", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Transport;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedPublisher {
        responses: Mutex<Vec<PublishResult<PublishResponse>>>,
        requests: Mutex<Vec<PublishRequest>>,
    }

    impl ScriptedPublisher {
        fn new(responses: Vec<PublishResult<PublishResponse>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Publisher for ScriptedPublisher {
        async fn publish(&self, request: &PublishRequest) -> PublishResult<PublishResponse> {
            self.requests.lock().unwrap().push(request.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(PublishResponse::new(200, "OK"))
            } else {
                responses.remove(0)
            }
        }
    }

    /// 每次调用都 panic 的发送方
    struct PanickingPublisher;

    #[async_trait]
    impl Publisher for PanickingPublisher {
        async fn publish(&self, _request: &PublishRequest) -> PublishResult<PublishResponse> {
            panic!("agent exploded");
        }
    }

    fn session(publisher: Arc<ScriptedPublisher>) -> PublicationSession {
        PublicationSession::new(
            SessionId(1),
            publisher,
            "alice@example.com",
            Credentials::new("alice", "secret"),
            Route::new("10.0.0.1", 5060, Transport::Udp),
            600,
        )
    }

    #[tokio::test]
    async fn test_publish_success_then_stop() {
        let publisher = ScriptedPublisher::new(vec![
            Ok(PublishResponse::new(200, "OK").with_etag("etag-1")),
            Ok(PublishResponse::new(200, "OK")),
        ]);
        let mut s = session(publisher.clone());

        let t = s.start(b"<presence/>".to_vec()).await;
        assert_eq!(t.state, SessionState::Published);
        assert_eq!(t.code, Some(200));
        assert_eq!(s.entity_tag(), Some("etag-1"));

        let t = s.stop().await.unwrap();
        assert_eq!(t.state, SessionState::Unpublished);
        assert!(t.is_success_code());
        assert!(s.stop().await.is_none());

        let requests = publisher.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].event, "presence");
        assert_eq!(requests[0].content_type, "application/pidf+xml");
        assert!(requests[1].is_removal());
        assert_eq!(requests[1].if_match.as_deref(), Some("etag-1"));
    }

    #[tokio::test]
    async fn test_auth_failure_is_classified() {
        let publisher = ScriptedPublisher::new(vec![Ok(PublishResponse::new(403, "Forbidden"))]);
        let mut s = session(publisher);
        let t = s.start(Vec::new()).await;
        assert_eq!(t.state, SessionState::Unpublished);
        assert!(t.is_auth_failure());
        assert!(s.state().is_terminal());
    }

    #[tokio::test]
    async fn test_transport_error_becomes_unpublished() {
        let publisher =
            ScriptedPublisher::new(vec![Err(PublishError::transport("connection refused"))]);
        let mut s = session(publisher.clone());
        let t = s.start(Vec::new()).await;
        assert_eq!(t.state, SessionState::Unpublished);
        assert_eq!(t.code, None);
        assert!(!t.is_auth_failure());
        // stop on a failed session sends nothing
        assert!(s.stop().await.is_none());
        assert_eq!(publisher.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_only_once() {
        let publisher = ScriptedPublisher::new(vec![]);
        let mut s = session(publisher.clone());
        s.start(Vec::new()).await;
        let t = s.start(Vec::new()).await;
        assert_eq!(t.state, SessionState::Published);
        assert_eq!(publisher.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_inherited_entity_tag_is_sent() {
        let publisher = ScriptedPublisher::new(vec![]);
        let mut s = session(publisher.clone()).with_entity_tag(Some("old".into()));
        s.start(Vec::new()).await;
        assert_eq!(
            publisher.requests.lock().unwrap()[0].if_match.as_deref(),
            Some("old")
        );
        assert_eq!(s.entity_tag(), Some("old"));
    }

    #[tokio::test]
    async fn test_spawned_session_reports() {
        let publisher = ScriptedPublisher::new(vec![]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = session(publisher).spawn(Vec::new(), move |r| {
            let _ = tx.send(r);
        });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, SessionId(1));
        assert_eq!(first.transition.state, SessionState::Published);

        handle.unpublish();
        handle.unpublish();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.transition.state, SessionState::Unpublished);
        // task ends after the terminal state; the report channel closes
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publisher_panic_becomes_transient_failure() {
        let mut s = PublicationSession::new(
            SessionId(3),
            Arc::new(PanickingPublisher),
            "alice@example.com",
            Credentials::new("alice", "secret"),
            Route::new("10.0.0.1", 5060, Transport::Udp),
            600,
        );
        let t = s.start(Vec::new()).await;
        assert_eq!(t.state, SessionState::Unpublished);
        assert_eq!(t.code, None);
        assert!(!t.is_auth_failure());
        assert!(t.reason.contains("publisher task failed"));
        assert!(s.state().is_terminal());
    }

    #[tokio::test]
    async fn test_spawned_session_reports_publisher_panic() {
        let session = PublicationSession::new(
            SessionId(4),
            Arc::new(PanickingPublisher),
            "alice@example.com",
            Credentials::new("alice", "secret"),
            Route::new("10.0.0.1", 5060, Transport::Udp),
            600,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = session.spawn(Vec::new(), move |r| {
            let _ = tx.send(r);
        });

        let report = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("no report after panic")
            .unwrap();
        assert_eq!(report.id, SessionId(4));
        assert_eq!(report.transition.state, SessionState::Unpublished);
        assert_eq!(report.transition.code, None);
    }
}
