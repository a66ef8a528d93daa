mod common;

use std::sync::Arc;
use std::time::Duration;

use quietfetch::backends::{BackendError, BackendKind};
use quietfetch::challenges::pool::{ChallengePool, ChallengeSolver};
use quietfetch::challenges::tracker::ChallengeTracker;
use quietfetch::modules::circuit::{CircuitBreaker, CircuitConfig, CircuitPhase};
use quietfetch::modules::events::{RecordingHandler, TransportEvent};
use quietfetch::modules::session::RotationPolicy;
use quietfetch::transport::{
    TransportClientBuilder, TransportConfig, TransportError, TransportRegistry,
};
use tokio::time::Instant;

use common::{BLOCK_PAGE, EngineBehavior, MockEngine, Reply, Script, ScriptedFactory, open_limiter};

const PLAIN: &str = "https://platform.test/api/v9/ping";
const CRITICAL: &str = "https://platform.test/api/v9/users/@me";

fn config() -> TransportConfig {
    TransportConfig {
        secondary_probability: 0.0,
        ..TransportConfig::default()
    }
}

fn builder(script: &Arc<Script>) -> TransportClientBuilder {
    TransportClientBuilder::new()
        .with_config(config())
        .with_backend_factory(ScriptedFactory::new(Arc::clone(script)))
        .with_rate_limiter(open_limiter())
}

fn solver(engine: &MockEngine) -> ChallengeSolver {
    let pool = ChallengePool::new(Arc::new(engine.clone()), 1);
    ChallengeSolver::new(ChallengeTracker::default(), pool, open_limiter())
}

#[tokio::test(start_paused = true)]
async fn waits_out_retry_after_then_succeeds() {
    let script = Script::new();
    script.push(Reply::status(429, "{}").with_header("retry-after", "2"));
    script.push(Reply::ok("pong"));
    let recorder = Arc::new(RecordingHandler::default());
    let client = builder(&script)
        .with_event_handler(recorder.clone())
        .build("s-429")
        .unwrap();

    let started = Instant::now();
    let response = client.get(PLAIN).await.unwrap();

    assert_eq!(response.text(), "pong");
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(script.sent().len(), 2);
    assert!(recorder
        .events()
        .iter()
        .any(|event| matches!(event, TransportEvent::Retry(retry) if retry.scheduled_after == Duration::from_secs(2))));
}

#[tokio::test(start_paused = true)]
async fn hostile_retry_after_is_clamped() {
    let script = Script::new();
    script.push(Reply::status(429, "{}").with_header("retry-after", "1e30"));
    script.push(Reply::status(429, r#"{"retry_after": 1e300}"#));
    script.push(Reply::status(429, "{}").with_header("retry-after", "86400000"));
    script.push(Reply::ok("pong"));
    let client = builder(&script)
        .with_config(TransportConfig {
            max_retry_after: Duration::from_secs(10),
            ..config()
        })
        .build("s-hostile")
        .unwrap();

    let started = Instant::now();
    let response = client.get(PLAIN).await.unwrap();

    assert_eq!(response.text(), "pong");
    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(30), "waited {waited:?}");
    assert!(waited < Duration::from_secs(60), "waited {waited:?}");
    assert_eq!(script.sent().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_retries_are_bounded() {
    let script = Script::new();
    script.respond_with(|_| Reply::status(429, r#"{"retry_after": 0.5}"#));
    let client = builder(&script)
        .with_config(TransportConfig {
            max_rate_limit_retries: 3,
            ..config()
        })
        .build("s-bounded")
        .unwrap();

    let err = client.get(PLAIN).await.unwrap_err();

    assert!(matches!(err, TransportError::RateLimited { attempts: 3 }));
    assert_eq!(script.sent().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn falls_back_to_alternate_backend_once() {
    let script = Script::new();
    script.push(Reply::Fail(BackendError::Transport("connection reset".into())));
    script.push(Reply::ok("fine"));
    let client = builder(&script).build("s-fallback").unwrap();

    let response = client.get(PLAIN).await.unwrap();

    assert_eq!(response.backend(), BackendKind::Secondary);
    let kinds: Vec<BackendKind> = script.sent().iter().map(|sent| sent.kind).collect();
    assert_eq!(kinds, vec![BackendKind::Primary, BackendKind::Secondary]);
}

#[tokio::test(start_paused = true)]
async fn both_backends_failing_is_transient() {
    let script = Script::new();
    script.push(Reply::Fail(BackendError::Transport("reset".into())));
    script.push(Reply::Fail(BackendError::Timeout(Duration::from_secs(30))));
    let client = builder(&script).build("s-down").unwrap();

    let err = client.get(PLAIN).await.unwrap_err();

    assert!(matches!(err, TransportError::TransientNetwork(_)));
    assert_eq!(script.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn challenge_material_is_reattached() {
    let script = Script::new();
    script.push(Reply::status(403, BLOCK_PAGE));
    let engine = MockEngine::new(EngineBehavior::Solve);
    let client = builder(&script)
        .with_challenge_solver(solver(&engine))
        .build("s-challenge")
        .unwrap();

    client.get(PLAIN).await.unwrap();
    client.get(PLAIN).await.unwrap();

    let sent = script.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].header("cookie"), None);
    assert_eq!(sent[1].header("cookie"), Some("cf_clearance=solved"));
    assert_eq!(sent[2].header("cookie"), Some("cf_clearance=solved"));
    assert_eq!(engine.launched.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(client.stats().await.session.has_challenge_material);
}

#[tokio::test(start_paused = true)]
async fn second_block_after_solving_is_unresolved() {
    let script = Script::new();
    script.push(Reply::status(403, BLOCK_PAGE));
    script.push(Reply::status(503, BLOCK_PAGE));
    let engine = MockEngine::new(EngineBehavior::Solve);
    let client = builder(&script)
        .with_challenge_solver(solver(&engine))
        .build("s-stuck")
        .unwrap();

    let err = client.get(PLAIN).await.unwrap_err();

    assert!(matches!(err, TransportError::ChallengeUnresolved(_)));
    assert_eq!(script.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn block_without_solver_is_unresolved() {
    let script = Script::new();
    script.push(Reply::status(403, BLOCK_PAGE));
    let client = builder(&script).build("s-nosolver").unwrap();

    let err = client.get(PLAIN).await.unwrap_err();

    assert!(matches!(err, TransportError::ChallengeUnresolved(_)));
}

#[tokio::test(start_paused = true)]
async fn plain_error_status_is_not_a_challenge() {
    let script = Script::new();
    script.push(Reply::status(404, r#"{"message": "Unknown Channel"}"#));
    let client = builder(&script).build("s-404").unwrap();

    let err = client.get(PLAIN).await.unwrap_err();

    assert!(matches!(err, TransportError::Status { status: 404, ref body } if body.contains("Unknown Channel")));
}

#[tokio::test(start_paused = true)]
async fn rotation_swaps_backends_and_clears_material() {
    let script = Script::new();
    script.push(Reply::status(403, BLOCK_PAGE));
    let engine = MockEngine::new(EngineBehavior::Solve);
    let factory = ScriptedFactory::new(Arc::clone(&script));
    let recorder = Arc::new(RecordingHandler::default());
    let client = TransportClientBuilder::new()
        .with_config(TransportConfig {
            rotation: RotationPolicy {
                request_threshold: (3, 3),
                ..RotationPolicy::default()
            },
            ..config()
        })
        .with_backend_factory(factory.clone())
        .with_rate_limiter(open_limiter())
        .with_challenge_solver(solver(&engine))
        .with_event_handler(recorder.clone())
        .build("s-rotate")
        .unwrap();

    // The solve retry belongs to the first request and does not count.
    client.get(PLAIN).await.unwrap();
    client.get(PLAIN).await.unwrap();
    client.get(PLAIN).await.unwrap();

    let sent = script.sent();
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[2].header("cookie"), Some("cf_clearance=solved"));
    assert_eq!(sent[3].header("cookie"), None);

    let stats = client.stats().await;
    assert_eq!(stats.session.rotations, 1);
    assert_eq!(stats.session.request_count, 0);
    assert!(!stats.session.has_challenge_material);
    assert_eq!(factory.created.load(std::sync::atomic::Ordering::SeqCst), 4);
    assert!(recorder
        .events()
        .iter()
        .any(|event| matches!(event, TransportEvent::Rotation(_))));
}

#[tokio::test(start_paused = true)]
async fn mechanical_cadence_gets_jitter() {
    let script = Script::new();
    let client = builder(&script).build("s-cadence").unwrap();

    for _ in 0..6 {
        client.get(PLAIN).await.unwrap();
    }
    let started = Instant::now();
    client.get(PLAIN).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn critical_failures_open_the_circuit() {
    let script = Script::new();
    script.respond_with(|_| Reply::status(503, "upstream unavailable"));
    let circuit = CircuitBreaker::new(CircuitConfig {
        failure_threshold: 2,
        cooldown: Duration::from_secs(60),
        backoff_base: Duration::from_secs(1),
        max_backoff: Duration::from_secs(10),
    });
    let client = builder(&script)
        .with_circuit_breaker(circuit.clone())
        .build("s-circuit")
        .unwrap();

    let first = client.get(CRITICAL).await.unwrap_err();
    assert!(matches!(first, TransportError::Status { status: 503, .. }));
    let second = client.get(CRITICAL).await.unwrap_err();
    assert!(matches!(second, TransportError::CircuitOpen { retry_in } if retry_in == Duration::from_secs(60)));
    assert_eq!(client.circuit_phase(), CircuitPhase::Open);

    tokio::time::advance(Duration::from_secs(20)).await;
    let rejected = client.get(CRITICAL).await.unwrap_err();
    assert!(matches!(rejected, TransportError::CircuitOpen { retry_in } if retry_in <= Duration::from_secs(40)));
    assert_eq!(script.sent().len(), 2);

    // Non-critical paths bypass the breaker entirely.
    assert!(client.get(PLAIN).await.is_err());
    assert_eq!(script.sent().len(), 3);

    tokio::time::advance(Duration::from_secs(41)).await;
    script.push(Reply::ok("{}"));
    client.get(CRITICAL).await.unwrap();
    assert_eq!(circuit.state().phase, CircuitPhase::Closed);
}

#[tokio::test(start_paused = true)]
async fn client_errors_do_not_count_against_the_circuit() {
    let script = Script::new();
    script.respond_with(|_| Reply::status(401, "unauthorized"));
    let circuit = CircuitBreaker::new(CircuitConfig {
        failure_threshold: 1,
        ..CircuitConfig::default()
    });
    let client = builder(&script)
        .with_circuit_breaker(circuit.clone())
        .build("s-401")
        .unwrap();

    for _ in 0..3 {
        let err = client.get(CRITICAL).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 401, .. }));
    }
    assert_eq!(circuit.state().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn registry_shares_closes_and_sweeps_sessions() {
    let script = Script::new();
    let registry = TransportRegistry::new(builder(&script)).with_max_session_age(Duration::from_secs(3600));

    let first = registry.get_or_create("alpha").unwrap();
    let again = registry.get_or_create("alpha").unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    assert!(registry.remove("alpha"));
    assert!(first.is_closed());
    assert!(matches!(first.get(PLAIN).await.unwrap_err(), TransportError::Closed));

    registry.get_or_create("beta").unwrap();
    assert_eq!(registry.sweep().await, 0);
    tokio::time::advance(Duration::from_secs(2 * 3600)).await;
    assert_eq!(registry.sweep().await, 1);
    assert!(registry.is_empty());
}
