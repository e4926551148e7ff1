use async_trait::async_trait;
use chrono::Local;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sip_presence_publisher::controller::{
    ControllerConfig, PublishController, PublishMachine, RetryPolicy,
};
use sip_presence_publisher::diagnostics::DiagnosticFlags;
use sip_presence_publisher::error::{DnsError, PublishError, PublishResult};
use sip_presence_publisher::presence::{
    FixedNoteSource, NoteSource, PresenceDocument, PresenceMutator,
};
use sip_presence_publisher::publication::{
    Credentials, PublishRequest, PublishResponse, Publisher,
};
use sip_presence_publisher::routing::{ResolveTarget, Route, StaticRouteResolver, Transport};

type Responder = Box<dyn Fn(&PublishRequest) -> PublishResult<PublishResponse> + Send + Sync>;

/// 内存中的 Presence Agent
struct FakeAgent {
    responder: Responder,
    requests: Mutex<Vec<PublishRequest>>,
}

impl FakeAgent {
    fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn accepting() -> Arc<Self> {
        Self::new(Box::new(|req| {
            if req.is_removal() {
                Ok(PublishResponse::new(200, "OK"))
            } else {
                Ok(PublishResponse::new(200, "OK").with_etag("etag-1"))
            }
        }))
    }

    fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Publisher for FakeAgent {
    async fn publish(&self, request: &PublishRequest) -> PublishResult<PublishResponse> {
        self.requests.lock().unwrap().push(request.clone());
        (self.responder)(request)
    }
}

fn route(host: &str) -> Route {
    Route::new(host, 5060, Transport::Udp)
}

fn policy(interval: Duration) -> RetryPolicy {
    RetryPolicy {
        interval,
        resolve_retry_min: Duration::from_millis(10),
        resolve_retry_max: Duration::from_millis(20),
        backoff_min: Duration::from_millis(10),
        backoff_max: Duration::from_millis(40),
    }
}

/// 永远来不及返回的便签来源
struct StalledNotes;

#[async_trait]
impl NoteSource for StalledNotes {
    async fn random_note(&self) -> Option<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        None
    }
}

fn controller(
    resolver: Arc<StaticRouteResolver>,
    agent: Arc<FakeAgent>,
    interval: Duration,
) -> PublishController<StdRng, FixedNoteSource> {
    controller_with_notes(
        resolver,
        agent,
        interval,
        FixedNoteSource(Some("integration".to_string())),
    )
}

fn controller_with_notes<N: NoteSource + 'static>(
    resolver: Arc<StaticRouteResolver>,
    agent: Arc<FakeAgent>,
    interval: Duration,
    notes: N,
) -> PublishController<StdRng, N> {
    let policy = policy(interval);
    let config = ControllerConfig::new(
        "alice@example.com",
        Credentials::new("alice", "secret"),
        ResolveTarget::domain("example.com"),
    )
    .with_policy(policy.clone());
    let document = PresenceDocument::new(
        "alice@example.com",
        "test-agent/1.0",
        Local::now().fixed_offset(),
    );
    let mutator = PresenceMutator::new(StdRng::seed_from_u64(7));
    PublishController::with_machine(
        config,
        resolver,
        agent,
        document,
        mutator,
        notes,
        Arc::new(DiagnosticFlags::default()),
        PublishMachine::with_seed(policy, 7),
    )
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn publishes_then_unpublishes_on_stop() {
    let resolver = Arc::new(StaticRouteResolver::new(vec![route("10.0.0.1")]));
    let agent = FakeAgent::accepting();
    let c = controller(resolver, agent.clone(), Duration::from_secs(60));
    let handle = c.handle();
    let task = tokio::spawn(c.run());

    wait_for(|| agent.count() == 1).await;
    handle.stop();
    handle.stop();
    assert!(task.await.unwrap());

    let requests = agent.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].route, route("10.0.0.1"));
    assert_eq!(requests[0].event, "presence");
    let body = String::from_utf8(requests[0].body.clone().unwrap()).unwrap();
    assert!(body.contains("entity=\"sip:alice@example.com\""));
    assert!(requests[1].is_removal());
    assert_eq!(requests[1].if_match.as_deref(), Some("etag-1"));
}

#[tokio::test]
async fn rotates_to_next_route_after_failure() {
    let resolver = Arc::new(StaticRouteResolver::new(vec![
        route("10.0.0.1"),
        route("10.0.0.2"),
        route("10.0.0.3"),
    ]));
    let agent = FakeAgent::new(Box::new(|req| {
        if req.route.address == "10.0.0.1" {
            Ok(PublishResponse::new(503, "Service Unavailable"))
        } else if req.route.address == "10.0.0.2" {
            Err(PublishError::transport("connection refused"))
        } else {
            Ok(PublishResponse::new(200, "OK"))
        }
    }));
    let c = controller(resolver.clone(), agent.clone(), Duration::from_secs(60));
    let handle = c.handle();
    let task = tokio::spawn(c.run());

    wait_for(|| agent.count() == 3).await;
    handle.stop();
    assert!(task.await.unwrap());

    let hosts: Vec<String> = agent
        .requests()
        .iter()
        .take(3)
        .map(|r| r.route.address.clone())
        .collect();
    assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    // one batch served all three attempts
    assert_eq!(resolver.calls(), 1);
}

#[tokio::test]
async fn authentication_failure_stops_without_retry() {
    let resolver = Arc::new(StaticRouteResolver::new(vec![
        route("10.0.0.1"),
        route("10.0.0.2"),
    ]));
    let agent = FakeAgent::new(Box::new(|_| Ok(PublishResponse::new(403, "Forbidden"))));
    let c = controller(resolver.clone(), agent.clone(), Duration::from_millis(20));

    let success = tokio::time::timeout(Duration::from_secs(5), c.run())
        .await
        .expect("controller did not stop after 403");
    assert!(!success);
    assert_eq!(agent.count(), 1);
    assert_eq!(resolver.calls(), 1);
}

#[tokio::test]
async fn republishes_on_same_route_with_entity_tag() {
    let resolver = Arc::new(StaticRouteResolver::new(vec![route("10.0.0.1")]));
    let agent = FakeAgent::accepting();
    let c = controller(resolver, agent.clone(), Duration::from_millis(30));
    let handle = c.handle();
    let task = tokio::spawn(c.run());

    wait_for(|| agent.count() >= 3).await;
    handle.stop();
    assert!(task.await.unwrap());

    let requests = agent.requests();
    assert_eq!(requests[0].if_match, None);
    assert_eq!(requests[1].if_match.as_deref(), Some("etag-1"));
    assert!(!requests[1].is_removal());
    assert!(requests.last().unwrap().is_removal());
}

#[tokio::test]
async fn retries_dns_until_routes_are_found() {
    let resolver = Arc::new(StaticRouteResolver::scripted(vec![
        Err(DnsError::Timeout),
        Err(DnsError::NxDomain("example.com".into())),
        Ok(vec![route("10.0.0.9")]),
    ]));
    let agent = FakeAgent::accepting();
    let c = controller(resolver.clone(), agent.clone(), Duration::from_secs(60));
    let handle = c.handle();
    let task = tokio::spawn(c.run());

    wait_for(|| agent.count() == 1).await;
    assert_eq!(resolver.calls(), 3);
    handle.stop();
    assert!(task.await.unwrap());
}

#[tokio::test]
async fn backs_off_and_resolves_again_after_exhausting_routes() {
    let resolver = Arc::new(StaticRouteResolver::new(vec![route("10.0.0.1")]));
    let agent = FakeAgent::new(Box::new(|_| Ok(PublishResponse::new(500, "Server Error"))));
    let c = controller(resolver.clone(), agent.clone(), Duration::from_secs(60));
    let handle = c.handle();
    let task = tokio::spawn(c.run());

    wait_for(|| resolver.calls() >= 3).await;
    handle.stop();
    // last attempt failed, nothing to unpublish
    assert!(!task.await.unwrap());
    assert!(agent.requests().iter().all(|r| !r.is_removal()));
}

#[tokio::test]
async fn stop_while_resolving_sends_nothing() {
    let resolver = Arc::new(StaticRouteResolver::scripted(vec![Err(DnsError::Timeout)]));
    let agent = FakeAgent::accepting();
    let c = controller(resolver.clone(), agent.clone(), Duration::from_secs(60));
    let handle = c.handle();
    let task = tokio::spawn(c.run());

    wait_for(|| resolver.calls() >= 1).await;
    handle.stop();
    assert!(!task.await.unwrap());
    assert_eq!(agent.count(), 0);
}

#[tokio::test]
async fn publisher_panic_is_retried_like_a_transport_error() {
    let resolver = Arc::new(StaticRouteResolver::new(vec![route("10.0.0.1")]));
    let attempts = AtomicUsize::new(0);
    let agent = FakeAgent::new(Box::new(move |req| {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("agent crashed mid-request");
        }
        if req.is_removal() {
            Ok(PublishResponse::new(200, "OK"))
        } else {
            Ok(PublishResponse::new(200, "OK").with_etag("etag-2"))
        }
    }));
    let c = controller(resolver.clone(), agent.clone(), Duration::from_secs(60));
    let handle = c.handle();
    let task = tokio::spawn(c.run());

    // backoff, resolve again, publish again
    wait_for(|| agent.count() >= 2).await;
    handle.stop();
    assert!(task.await.unwrap());

    let requests = agent.requests();
    assert!(!requests[1].is_removal());
    assert!(requests.last().unwrap().is_removal());
    assert_eq!(requests.last().unwrap().if_match.as_deref(), Some("etag-2"));
    assert!(resolver.calls() >= 2);
}

#[tokio::test]
async fn stalled_note_source_does_not_block_stop() {
    let resolver = Arc::new(StaticRouteResolver::new(vec![route("10.0.0.1")]));
    let agent = FakeAgent::accepting();
    let c = controller_with_notes(
        resolver.clone(),
        agent.clone(),
        Duration::from_secs(60),
        StalledNotes,
    );
    let handle = c.handle();
    let task = tokio::spawn(c.run());

    wait_for(|| resolver.calls() >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.stop();

    let success = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("stop was not handled while the note was pending")
        .unwrap();
    assert!(!success);
    assert_eq!(agent.count(), 0);
}
