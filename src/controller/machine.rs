/// 发布控制状态机
///
/// 纯状态转换：`handle(event, now) -> Vec<Effect>`。网络和定时器由调用方执行，
/// 结果再以事件形式送回。
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::backoff::{BackoffState, MAX_WAIT, MIN_WAIT};
use crate::error::DnsError;
use crate::publication::{SessionId, SessionReport, SessionState};
use crate::routing::{ResolutionBatch, Route};

/// 控制器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Resolving,
    Publishing,
    Published,
    Unpublishing,
    /// 认证失败后的终态
    Failed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Resolving => "resolving",
            ControllerState::Publishing => "publishing",
            ControllerState::Published => "published",
            ControllerState::Unpublishing => "unpublishing",
            ControllerState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 输入事件
#[derive(Debug, Clone)]
pub enum Event {
    Start,
    Resolved(ResolutionBatch),
    ResolveFailed(DnsError),
    ResolveTimerFired,
    Session(SessionReport),
    /// 文档无效，本周期未发送
    PublishSkipped { session: SessionId, reason: String },
    RepublishTimerFired,
    StopRequested,
}

/// 输出动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Resolve,
    ScheduleResolve(Duration),
    /// 修改文档并在新会话中发布；`replaces` 为上一个已发布会话
    StartSession {
        session: SessionId,
        route: Route,
        replaces: Option<SessionId>,
    },
    ScheduleRepublish(Duration),
    Unpublish(SessionId),
    /// 丢弃会话句柄，不删除发布
    ReleaseSession(SessionId),
    Finish { success: bool },
}

/// 重试与周期参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 两次发布之间的间隔
    pub interval: Duration,
    pub resolve_retry_min: Duration,
    pub resolve_retry_max: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            resolve_retry_min: Duration::from_secs(1),
            resolve_retry_max: Duration::from_secs(2),
            backoff_min: MIN_WAIT,
            backoff_max: MAX_WAIT,
        }
    }
}

impl RetryPolicy {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

pub struct PublishMachine {
    state: ControllerState,
    policy: RetryPolicy,
    backoff: BackoffState,
    rng: StdRng,
    routes: VecDeque<Route>,
    valid_until: Option<Instant>,
    next_session: u64,
    in_flight: Option<(SessionId, Route)>,
    published: Option<(SessionId, Route)>,
    unpublishing: Option<SessionId>,
    stopping: bool,
    success: bool,
}

impl PublishMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_rng(policy, StdRng::from_os_rng())
    }

    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self::with_rng(policy, StdRng::seed_from_u64(seed))
    }

    fn with_rng(policy: RetryPolicy, rng: StdRng) -> Self {
        Self {
            state: ControllerState::Idle,
            backoff: BackoffState::new(policy.backoff_min, policy.backoff_max),
            policy,
            rng,
            routes: VecDeque::new(),
            valid_until: None,
            next_session: 0,
            in_flight: None,
            published: None,
            unpublishing: None,
            stopping: false,
            success: false,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// 最近一次发布/删除是否成功
    pub fn success(&self) -> bool {
        self.success
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    pub fn backoff(&self) -> &BackoffState {
        &self.backoff
    }

    pub fn in_flight(&self) -> Option<SessionId> {
        self.in_flight.as_ref().map(|(id, _)| *id)
    }

    pub fn published(&self) -> Option<SessionId> {
        self.published.as_ref().map(|(id, _)| *id)
    }

    pub fn remaining_routes(&self) -> usize {
        self.routes.len()
    }

    pub fn handle(&mut self, event: Event, now: Instant) -> Vec<Effect> {
        match event {
            Event::Start => self.on_start(),
            Event::Resolved(batch) => self.on_resolved(batch),
            Event::ResolveFailed(err) => self.on_resolve_failed(err),
            Event::ResolveTimerFired => self.on_resolve_timer(),
            Event::Session(report) => self.on_session(report, now),
            Event::PublishSkipped { session, reason } => self.on_skipped(session, reason),
            Event::RepublishTimerFired => self.on_republish_timer(),
            Event::StopRequested => self.on_stop(),
        }
    }

    fn on_start(&mut self) -> Vec<Effect> {
        if self.state != ControllerState::Idle || self.stopping {
            return Vec::new();
        }
        self.state = ControllerState::Resolving;
        vec![Effect::Resolve]
    }

    fn on_resolved(&mut self, batch: ResolutionBatch) -> Vec<Effect> {
        if self.state != ControllerState::Resolving || self.stopping {
            return Vec::new();
        }
        if batch.is_empty() {
            return self.on_resolve_failed(DnsError::Lookup("no routes returned".to_string()));
        }

        self.valid_until = Some(batch.valid_until());
        self.routes = batch.into_queue();
        match self.routes.pop_front() {
            Some(route) => vec![self.start_session(route, None)],
            None => Vec::new(),
        }
    }

    fn on_resolve_failed(&mut self, err: DnsError) -> Vec<Effect> {
        if self.state != ControllerState::Resolving || self.stopping {
            return Vec::new();
        }
        warn!("DNS lookup failed: {}", err);
        let (min, max) = (self.policy.resolve_retry_min, self.policy.resolve_retry_max);
        let delay = if max > min {
            Duration::from_secs_f64(self.rng.random_range(min.as_secs_f64()..=max.as_secs_f64()))
        } else {
            min
        };
        vec![Effect::ScheduleResolve(delay)]
    }

    fn on_resolve_timer(&mut self) -> Vec<Effect> {
        if self.state != ControllerState::Resolving || self.stopping {
            return Vec::new();
        }
        vec![Effect::Resolve]
    }

    fn on_republish_timer(&mut self) -> Vec<Effect> {
        if self.state != ControllerState::Published || self.stopping {
            return Vec::new();
        }
        match self.published.clone() {
            Some((previous, route)) => vec![self.start_session(route, Some(previous))],
            None => Vec::new(),
        }
    }

    fn on_session(&mut self, report: SessionReport, now: Instant) -> Vec<Effect> {
        let id = report.id;
        let t = &report.transition;

        if self.state == ControllerState::Unpublishing {
            if self.unpublishing != Some(id) {
                return Vec::new();
            }
            if self.in_flight() == Some(id) {
                // 停止前发出的 PUBLISH 的结果
                if t.state == SessionState::Published {
                    self.in_flight = None;
                    self.success = true;
                    return Vec::new();
                }
                info!(
                    "Unpublished from {}: {} {}",
                    report.route,
                    t.code.unwrap_or(0),
                    t.reason
                );
                self.success = false;
                return self.unpublish_previous(id);
            }
            if t.state == SessionState::Unpublished {
                info!(
                    "Unpublished from {}: {} {}",
                    report.route,
                    t.code.unwrap_or(0),
                    t.reason
                );
                self.success = t.is_success_code();
                return self.finish(ControllerState::Idle);
            }
            return Vec::new();
        }

        if self.in_flight() != Some(id) {
            return Vec::new();
        }
        self.in_flight = None;

        match t.state {
            SessionState::Published => {
                info!("PUBLISH was successful at {}", report.route);
                self.success = true;
                self.backoff.reset();
                self.routes.clear();
                self.valid_until = None;
                self.state = ControllerState::Published;

                let mut effects = Vec::new();
                if let Some((previous, _)) = self.published.replace((id, report.route.clone())) {
                    effects.push(Effect::ReleaseSession(previous));
                }
                effects.push(Effect::ScheduleRepublish(self.policy.interval));
                effects
            }
            _ => {
                info!(
                    "Unpublished from {}: {} {}",
                    report.route,
                    t.code.unwrap_or(0),
                    t.reason
                );
                self.success = false;

                let mut effects = vec![Effect::ReleaseSession(id)];
                if let Some((previous, _)) = self.published.take() {
                    effects.push(Effect::ReleaseSession(previous));
                }

                if t.is_auth_failure() {
                    error!("认证失败 ({}), 停止发布", t.code.unwrap_or(0));
                    self.routes.clear();
                    effects.extend(self.finish(ControllerState::Failed));
                    return effects;
                }

                let batch_valid = self.valid_until.map(|v| now <= v).unwrap_or(false);
                if batch_valid {
                    if let Some(route) = self.routes.pop_front() {
                        effects.push(self.start_session(route, None));
                        return effects;
                    }
                }

                self.routes.clear();
                self.valid_until = None;
                let delay = self.backoff.on_failure(&mut self.rng);
                info!("重试前等待 {:.1}s", delay.as_secs_f64());
                self.state = ControllerState::Resolving;
                effects.push(Effect::ScheduleResolve(delay));
                effects
            }
        }
    }

    fn on_skipped(&mut self, session: SessionId, reason: String) -> Vec<Effect> {
        if self.state == ControllerState::Unpublishing && self.unpublishing == Some(session) {
            if self.in_flight() == Some(session) {
                return self.unpublish_previous(session);
            }
            return self.finish(ControllerState::Idle);
        }
        if self.in_flight() != Some(session) {
            return Vec::new();
        }
        error!("PIDF as currently defined is invalid: {}", reason);
        self.in_flight = None;

        let mut effects = vec![Effect::ReleaseSession(session)];
        if self.published.is_some() {
            self.state = ControllerState::Published;
            effects.push(Effect::ScheduleRepublish(self.policy.interval));
        } else {
            self.routes.clear();
            self.valid_until = None;
            self.state = ControllerState::Resolving;
            effects.push(Effect::ScheduleResolve(self.policy.interval));
        }
        effects
    }

    fn on_stop(&mut self) -> Vec<Effect> {
        if self.stopping {
            return Vec::new();
        }
        self.stopping = true;

        match self.state {
            ControllerState::Published | ControllerState::Publishing => {
                let target = self.in_flight().or_else(|| self.published());
                match target {
                    Some(id) => {
                        self.state = ControllerState::Unpublishing;
                        self.unpublishing = Some(id);
                        vec![Effect::Unpublish(id)]
                    }
                    None => self.finish(ControllerState::Idle),
                }
            }
            ControllerState::Idle | ControllerState::Resolving => self.finish(ControllerState::Idle),
            ControllerState::Unpublishing | ControllerState::Failed => Vec::new(),
        }
    }

    /// 停止时在途的 PUBLISH 没有成功，改为删除上一次周期留在服务器上的发布
    fn unpublish_previous(&mut self, failed: SessionId) -> Vec<Effect> {
        self.in_flight = None;
        match self.published.take() {
            Some((previous, route)) if previous != failed => {
                info!("删除 {} 上一次的发布", route);
                self.unpublishing = Some(previous);
                vec![Effect::ReleaseSession(failed), Effect::Unpublish(previous)]
            }
            _ => self.finish(ControllerState::Idle),
        }
    }

    fn start_session(&mut self, route: Route, replaces: Option<SessionId>) -> Effect {
        self.next_session += 1;
        let session = SessionId(self.next_session);
        self.in_flight = Some((session, route.clone()));
        self.state = ControllerState::Publishing;
        Effect::StartSession {
            session,
            route,
            replaces,
        }
    }

    fn finish(&mut self, state: ControllerState) -> Vec<Effect> {
        self.state = state;
        self.stopping = true;
        self.in_flight = None;
        self.published = None;
        self.unpublishing = None;
        vec![Effect::Finish {
            success: self.success,
        }]
    }
}
