/// 发布控制器运行时
///
/// 把状态机的 Effect 变成真实的 DNS 查询、定时器和后台会话，
/// 所有结果都通过同一个事件通道回到状态机，事件按顺序逐个处理。
use chrono::Local;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::machine::{Effect, Event, PublishMachine, RetryPolicy};
use crate::diagnostics::DiagnosticFlags;
use crate::presence::{NoteSource, PresenceDocument, PresenceMutator};
use crate::publication::{Credentials, PublicationSession, Publisher, SessionHandle, SessionId};
use crate::routing::{ResolveTarget, Route, RouteResolver, Transport};

/// 控制器配置
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// 账户地址 `user@domain`
    pub aor: String,
    pub credentials: Credentials,
    /// 解析目标：出站代理或账户域
    pub target: ResolveTarget,
    pub transports: Vec<Transport>,
    /// PUBLISH Expires
    pub expires: u32,
    pub policy: RetryPolicy,
}

impl ControllerConfig {
    pub fn new(aor: impl Into<String>, credentials: Credentials, target: ResolveTarget) -> Self {
        Self {
            aor: aor.into(),
            credentials,
            target,
            transports: vec![Transport::Udp, Transport::Tcp],
            expires: 600,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_transports(mut self, transports: Vec<Transport>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_expires(mut self, expires: u32) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// 事件通道上的消息
#[derive(Debug)]
enum Message {
    Event(Event),
    /// 后台取回的便签，随后修改文档并启动会话
    NoteReady {
        session: SessionId,
        route: Route,
        replaces: Option<SessionId>,
        note: Option<String>,
    },
}

/// 控制器句柄，可跨任务克隆
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl ControllerHandle {
    /// 请求停止；重复调用无副作用
    pub fn stop(&self) {
        if self.tx.send(Message::Event(Event::StopRequested)).is_err() {
            debug!("控制器已结束");
        }
    }
}

struct SessionEntry {
    handle: SessionHandle,
    etag: Option<String>,
}

pub struct PublishController<R, N> {
    config: ControllerConfig,
    resolver: Arc<dyn RouteResolver>,
    publisher: Arc<dyn Publisher>,
    document: PresenceDocument,
    mutator: PresenceMutator<R>,
    notes: Arc<N>,
    flags: Arc<DiagnosticFlags>,
    machine: PublishMachine,
    sessions: HashMap<SessionId, SessionEntry>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    cancel_token: CancellationToken,
    timer: Option<CancellationToken>,
}

impl<R, N> PublishController<R, N>
where
    R: Rng + Send,
    N: NoteSource + 'static,
{
    pub fn new(
        config: ControllerConfig,
        resolver: Arc<dyn RouteResolver>,
        publisher: Arc<dyn Publisher>,
        document: PresenceDocument,
        mutator: PresenceMutator<R>,
        notes: N,
        flags: Arc<DiagnosticFlags>,
    ) -> Self {
        let machine = PublishMachine::new(config.policy.clone());
        Self::with_machine(
            config, resolver, publisher, document, mutator, notes, flags, machine,
        )
    }

    /// 使用给定状态机（测试时可固定随机种子）
    pub fn with_machine(
        config: ControllerConfig,
        resolver: Arc<dyn RouteResolver>,
        publisher: Arc<dyn Publisher>,
        document: PresenceDocument,
        mutator: PresenceMutator<R>,
        notes: N,
        flags: Arc<DiagnosticFlags>,
        machine: PublishMachine,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            resolver,
            publisher,
            document,
            mutator,
            notes: Arc::new(notes),
            flags,
            machine,
            sessions: HashMap::new(),
            tx,
            rx,
            cancel_token: CancellationToken::new(),
            timer: None,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn flags(&self) -> Arc<DiagnosticFlags> {
        self.flags.clone()
    }

    pub fn document(&self) -> &PresenceDocument {
        &self.document
    }

    /// 运行直到停止或认证失败
    ///
    /// 返回最近一次发布（或删除发布）是否成功
    pub async fn run(mut self) -> bool {
        info!(
            "开始发布 {} via {} ({})",
            self.config.aor,
            self.config.target,
            self.config
                .transports
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(",")
        );

        let mut pending = vec![Message::Event(Event::Start)];
        loop {
            for message in pending.drain(..) {
                let finished = match message {
                    Message::Event(event) => self.dispatch(event),
                    Message::NoteReady {
                        session,
                        route,
                        replaces,
                        note,
                    } => {
                        self.launch_session(session, route, replaces, note);
                        None
                    }
                };
                if let Some(success) = finished {
                    self.shutdown();
                    return success;
                }
            }
            match self.rx.recv().await {
                Some(message) => pending.push(message),
                None => break,
            }
        }
        self.shutdown();
        self.machine.success()
    }

    fn dispatch(&mut self, event: Event) -> Option<bool> {
        if self.flags.trace_notifications() {
            info!("[{}] event: {:?}", self.machine.state(), event);
        }

        if let Event::Session(report) = &event {
            if let Some(entry) = self.sessions.get_mut(&report.id) {
                if report.etag.is_some() {
                    entry.etag = report.etag.clone();
                }
            }
        }

        let effects = self.machine.handle(event, Instant::now());
        for effect in effects {
            if let Some(success) = self.apply(effect) {
                return Some(success);
            }
        }
        None
    }

    fn apply(&mut self, effect: Effect) -> Option<bool> {
        match effect {
            Effect::Resolve => self.resolve(),
            Effect::ScheduleResolve(delay) => self.schedule(delay, Event::ResolveTimerFired),
            Effect::ScheduleRepublish(delay) => self.schedule(delay, Event::RepublishTimerFired),
            Effect::StartSession {
                session,
                route,
                replaces,
            } => self.start_session(session, route, replaces),
            Effect::Unpublish(id) => match self.sessions.get(&id) {
                Some(entry) => entry.handle.unpublish(),
                None => {
                    warn!("会话 {} 不存在，无需删除发布", id);
                    self.post(Event::PublishSkipped {
                        session: id,
                        reason: "session already released".to_string(),
                    });
                }
            },
            Effect::ReleaseSession(id) => {
                self.sessions.remove(&id);
            }
            Effect::Finish { success } => return Some(success),
        }
        None
    }

    fn post(&self, event: Event) {
        if self.tx.send(Message::Event(event)).is_err() {
            debug!("事件通道已关闭");
        }
    }

    fn resolve(&self) {
        let resolver = self.resolver.clone();
        let target = self.config.target.clone();
        let transports = self.config.transports.clone();
        let tx = self.tx.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let event = tokio::select! {
                result = resolver.resolve(&target, &transports) => match result {
                    Ok(batch) => Event::Resolved(batch),
                    Err(e) => Event::ResolveFailed(e),
                },
                _ = cancel_token.cancelled() => return,
            };
            let _ = tx.send(Message::Event(event));
        });
    }

    fn schedule(&mut self, delay: Duration, event: Event) {
        if let Some(previous) = self.timer.take() {
            previous.cancel();
        }
        let token = self.cancel_token.child_token();
        self.timer = Some(token.clone());
        let tx = self.tx.clone();

        debug!("{:?} 在 {:.1}s 后触发", event, delay.as_secs_f64());
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Message::Event(event));
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// 在后台取便签，取回后由 `launch_session` 继续
    fn start_session(&self, session: SessionId, route: Route, replaces: Option<SessionId>) {
        let notes = self.notes.clone();
        let tx = self.tx.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let note = tokio::select! {
                note = notes.random_note() => note,
                _ = cancel_token.cancelled() => return,
            };
            let _ = tx.send(Message::NoteReady {
                session,
                route,
                replaces,
                note,
            });
        });
    }

    fn launch_session(
        &mut self,
        id: SessionId,
        route: Route,
        replaces: Option<SessionId>,
        note: Option<String>,
    ) {
        // 停止或会话已被替换时不再发送
        if self.machine.is_stopping() || self.machine.in_flight() != Some(id) {
            debug!("会话 {} 已取消，跳过发布", id);
            return;
        }

        let now = Local::now().fixed_offset();
        self.mutator.mutate(&mut self.document, now, note);

        let body = match self.document.to_pidf() {
            Ok(body) => body,
            Err(e) => {
                self.post(Event::PublishSkipped {
                    session: id,
                    reason: e.to_string(),
                });
                return;
            }
        };
        if self.flags.trace_notifications() {
            info!("PIDF:\n{}", String::from_utf8_lossy(&body));
        }

        // 同一路由上沿用实体标签，刷新服务器上已有的发布
        let etag = replaces
            .and_then(|previous| self.sessions.get(&previous))
            .filter(|entry| entry.handle.route() == &route)
            .and_then(|entry| entry.etag.clone());

        let session = PublicationSession::new(
            id,
            self.publisher.clone(),
            self.config.aor.clone(),
            self.config.credentials.clone(),
            route,
            self.config.expires,
        )
        .with_entity_tag(etag.clone());

        let tx = self.tx.clone();
        let handle = session.spawn(body, move |report| {
            let _ = tx.send(Message::Event(Event::Session(report)));
        });
        self.sessions.insert(id, SessionEntry { handle, etag });
    }

    fn shutdown(&mut self) {
        self.cancel_token.cancel();
        self.timer = None;
        self.sessions.clear();
        info!("控制器已停止 ({})", self.machine.state());
    }
}
