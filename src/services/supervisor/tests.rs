//! Tests for the gate supervisor state machine

use super::*;
use crate::io::actuator::SimulatedActuator;
use async_trait::async_trait;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::broadcast::error::TryRecvError;

/// Authorizer that answers after a fixed delay, ignoring the deadline
struct ScriptedAuthorizer {
    outcome: AuthorizationOutcome,
    delay: Duration,
    calls: AtomicUsize,
    completed: AtomicBool,
}

impl ScriptedAuthorizer {
    fn new(outcome: AuthorizationOutcome, delay: Duration) -> Self {
        Self { outcome, delay, calls: AtomicUsize::new(0), completed: AtomicBool::new(false) }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authorizer for ScriptedAuthorizer {
    async fn request_authorization(
        &self,
        _plate: &PlateIdentifier,
        _deadline: Duration,
    ) -> AuthorizationOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        sleep(self.delay).await;
        self.completed.store(true, Ordering::SeqCst);
        self.outcome
    }
}

/// Simulated actuator that remembers every command
struct RecordingActuator {
    inner: SimulatedActuator,
    commands: parking_lot::Mutex<Vec<GatePosition>>,
}

impl RecordingActuator {
    fn new(travel: Duration) -> Self {
        Self { inner: SimulatedActuator::new(travel), commands: parking_lot::Mutex::new(Vec::new()) }
    }

    fn ever_opened(&self) -> bool {
        self.commands.lock().contains(&GatePosition::Open)
    }
}

#[async_trait]
impl Actuator for RecordingActuator {
    async fn set_position(&self, target: GatePosition) {
        self.commands.lock().push(target);
        self.inner.set_position(target).await;
    }

    fn indicators(&self) -> IndicatorState {
        self.inner.indicators()
    }

    fn position(&self) -> GatePosition {
        self.inner.position()
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

struct Harness {
    handle: SupervisorHandle,
    authorizer: Arc<ScriptedAuthorizer>,
    actuator: Arc<RecordingActuator>,
    metrics: Arc<Metrics>,
    transitions: broadcast::Receiver<GateTransition>,
}

const PLATE: &str = "KL-13-AB-9999";

fn test_config() -> Config {
    Config::default().with_controller_deadline_ms(2000).with_auto_close_ms(3000).with_travel_ms(500)
}

fn harness(outcome: AuthorizationOutcome, delay: Duration) -> Harness {
    let authorizer = Arc::new(ScriptedAuthorizer::new(outcome, delay));
    let actuator = Arc::new(RecordingActuator::new(Duration::from_millis(500)));
    let metrics = Arc::new(Metrics::new());
    let handle = GateSupervisor::spawn(
        &test_config(),
        authorizer.clone(),
        actuator.clone(),
        metrics.clone(),
        None,
    );
    let transitions = handle.subscribe();
    Harness { handle, authorizer, actuator, metrics, transitions }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

async fn next(rx: &mut broadcast::Receiver<GateTransition>) -> GateTransition {
    rx.recv().await.unwrap()
}

/// Receive transitions up to and including the next return to Closed
async fn until_closed(rx: &mut broadcast::Receiver<GateTransition>) -> Vec<GateTransition> {
    let mut seen = Vec::new();
    loop {
        let t = next(rx).await;
        seen.push(t);
        if t.to == GateState::Closed {
            return seen;
        }
    }
}

fn targets(seen: &[GateTransition]) -> Vec<GateState> {
    seen.iter().map(|t| t.to).collect()
}

#[tokio::test(start_paused = true)]
async fn test_authorized_full_cycle() {
    let mut h = harness(AuthorizationOutcome::Authorized, millis(50));
    assert!(h.handle.submit_plate(PLATE));

    let awaiting = next(&mut h.transitions).await;
    assert_eq!((awaiting.from, awaiting.to), (GateState::Closed, GateState::AwaitingAuthorization));

    let opening = next(&mut h.transitions).await;
    assert_eq!(opening.to, GateState::Opening);
    assert_eq!(opening.at - awaiting.at, millis(50));

    let open = next(&mut h.transitions).await;
    assert_eq!(open.to, GateState::Open);
    assert_eq!(open.at - opening.at, millis(500));
    assert!(h.handle.indicators().green());
    assert!(!h.handle.indicators().red());
    assert_eq!(h.handle.state(), GateState::Open);

    let rest = until_closed(&mut h.transitions).await;
    assert_eq!(targets(&rest), vec![GateState::Closing, GateState::Closed]);
    assert_eq!(rest[0].at - open.at, millis(3000));
    assert!(h.handle.indicators().red());
    assert!(!h.handle.indicators().green());

    assert_eq!(h.authorizer.calls(), 1);
    assert_eq!(h.metrics.gate_cycles_total(), 1);
    assert_eq!(h.metrics.outcome_count(AuthorizationOutcome::Authorized), 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_authorized_outcomes_fail_closed() {
    for outcome in [
        AuthorizationOutcome::Denied,
        AuthorizationOutcome::Timeout,
        AuthorizationOutcome::ControllerUnavailable,
        AuthorizationOutcome::MalformedResponse,
    ] {
        let mut h = harness(outcome, millis(10));
        h.handle.submit_plate(PLATE);

        let seen = until_closed(&mut h.transitions).await;
        assert_eq!(
            targets(&seen),
            vec![GateState::AwaitingAuthorization, GateState::Closed],
            "outcome {outcome}"
        );
        assert_eq!(h.handle.state(), GateState::Closed);
        assert!(h.handle.indicators().red());
        assert!(!h.handle.indicators().green());
        assert!(!h.actuator.ever_opened());
        assert_eq!(h.metrics.outcome_count(outcome), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalid_plates_never_reach_authorizer() {
    let h = harness(AuthorizationOutcome::Authorized, millis(10));
    let too_long = "A".repeat(33);
    let bad = ["", "kl-13-ab", "KL 13", "KL_13", "KL-13\n", "Ä-1", too_long.as_str()];
    for raw in bad {
        h.handle.submit_plate(raw);
    }
    h.handle.shutdown().await;

    assert_eq!(h.authorizer.calls(), 0);
    assert_eq!(h.metrics.plates_rejected(), bad.len() as u64);
    assert!(!h.actuator.ever_opened());
    assert_eq!(h.handle.state(), GateState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_plates_dropped_while_busy() {
    let mut h = harness(AuthorizationOutcome::Authorized, millis(1000));
    h.handle.submit_plate(PLATE);

    // Mid-authorization
    sleep(millis(100)).await;
    h.handle.submit_plate("AB-1");

    // Mid-open
    loop {
        if next(&mut h.transitions).await.to == GateState::Open {
            break;
        }
    }
    h.handle.submit_plate("AB-2");

    until_closed(&mut h.transitions).await;
    assert_eq!(h.authorizer.calls(), 1);
    assert_eq!(h.metrics.plates_dropped_busy(), 2);

    // Idle again: accepted
    h.handle.submit_plate("AB-3");
    let seen = until_closed(&mut h.transitions).await;
    assert_eq!(seen[0].to, GateState::AwaitingAuthorization);
    assert_eq!(h.authorizer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_discards_late_response() {
    // Authorizer ignores its deadline and would approve after 10s
    let mut h = harness(AuthorizationOutcome::Authorized, millis(10_000));
    h.handle.submit_plate(PLATE);

    let seen = until_closed(&mut h.transitions).await;
    assert_eq!(targets(&seen), vec![GateState::AwaitingAuthorization, GateState::Closed]);
    assert_eq!(seen[1].at - seen[0].at, millis(2000) + WATCHDOG_GRACE);
    assert_eq!(h.metrics.outcome_count(AuthorizationOutcome::Timeout), 1);

    // Well past the point the late approval would have landed
    sleep(millis(20_000)).await;
    assert_eq!(h.handle.state(), GateState::Closed);
    assert!(!h.authorizer.completed.load(Ordering::SeqCst));
    assert!(!h.actuator.ever_opened());
    assert_eq!(h.metrics.outcome_count(AuthorizationOutcome::Authorized), 0);
    assert!(matches!(h.transitions.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_explicit_close_preempts_timer() {
    let mut h = harness(AuthorizationOutcome::Authorized, millis(10));
    h.handle.submit_plate(PLATE);

    let open = loop {
        let t = next(&mut h.transitions).await;
        if t.to == GateState::Open {
            break t;
        }
    };

    sleep(millis(1000)).await;
    h.handle.close().await;

    let rest = until_closed(&mut h.transitions).await;
    assert_eq!(targets(&rest), vec![GateState::Closing, GateState::Closed]);
    assert_eq!(rest[0].at - open.at, millis(1000));

    // The cancelled auto-close timer must not fire a second close
    sleep(millis(10_000)).await;
    assert!(matches!(h.transitions.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.metrics.gate_cycles_total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_at_timer_expiry_closes_once() {
    let mut h = harness(AuthorizationOutcome::Authorized, millis(10));
    h.handle.submit_plate(PLATE);

    let open = loop {
        let t = next(&mut h.transitions).await;
        if t.to == GateState::Open {
            break t;
        }
    };

    // Close lands on the same instant the auto-close timer expires
    tokio::time::sleep_until(open.at + millis(3000)).await;
    h.handle.close().await;

    let rest = until_closed(&mut h.transitions).await;
    assert_eq!(targets(&rest), vec![GateState::Closing, GateState::Closed]);
    assert_eq!(rest[0].at - open.at, millis(3000));

    sleep(millis(10_000)).await;
    assert!(matches!(h.transitions.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.metrics.gate_cycles_total(), 1);
    assert_eq!(h.actuator.commands.lock().iter().filter(|p| **p == GatePosition::Closed).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_while_opening_is_latched() {
    let mut h = harness(AuthorizationOutcome::Authorized, millis(10));
    h.handle.submit_plate(PLATE);

    loop {
        if next(&mut h.transitions).await.to == GateState::Opening {
            break;
        }
    }
    h.handle.close().await;

    let rest = until_closed(&mut h.transitions).await;
    assert_eq!(targets(&rest), vec![GateState::Open, GateState::Closing, GateState::Closed]);
    // Closing starts as soon as the gate is open, without waiting for the timer
    assert_eq!(rest[1].at, rest[0].at);
}

#[tokio::test(start_paused = true)]
async fn test_close_trigger_when_closed_is_ignored() {
    let mut h = harness(AuthorizationOutcome::Authorized, millis(10));
    h.handle.close().await;
    sleep(millis(100)).await;
    assert!(matches!(h.transitions.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.handle.state(), GateState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_while_open_forces_closed() {
    let mut h = harness(AuthorizationOutcome::Authorized, millis(10));
    h.handle.submit_plate(PLATE);
    loop {
        if next(&mut h.transitions).await.to == GateState::Open {
            break;
        }
    }

    h.handle.shutdown().await;
    assert_eq!(h.handle.state(), GateState::Closed);
    assert_eq!(h.actuator.position(), GatePosition::Closed);
    assert!(h.handle.indicators().red());

    let t = next(&mut h.transitions).await;
    assert_eq!((t.from, t.to), (GateState::Open, GateState::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending_authorization() {
    let h = harness(AuthorizationOutcome::Authorized, millis(10_000));
    h.handle.submit_plate(PLATE);
    sleep(millis(100)).await;
    assert_eq!(h.handle.state(), GateState::AwaitingAuthorization);

    h.handle.shutdown().await;
    assert_eq!(h.handle.state(), GateState::Closed);

    sleep(millis(20_000)).await;
    assert!(!h.authorizer.completed.load(Ordering::SeqCst));
    assert!(!h.actuator.ever_opened());

    // Supervisor is gone; further events are not delivered
    h.handle.submit_plate(PLATE);
    assert_eq!(h.authorizer.calls(), 1);
}

/// Actuator whose open command does blocking work before updating its outputs
struct BlockingOpenActuator {
    outputs: parking_lot::Mutex<(GatePosition, IndicatorState)>,
}

impl BlockingOpenActuator {
    fn new() -> Self {
        let closed = GatePosition::Closed;
        Self { outputs: parking_lot::Mutex::new((closed, IndicatorState::for_position(closed))) }
    }
}

#[async_trait]
impl Actuator for BlockingOpenActuator {
    async fn set_position(&self, target: GatePosition) {
        if target == GatePosition::Open {
            std::thread::sleep(millis(50));
        }
        *self.outputs.lock() = (target, IndicatorState::for_position(target));
    }

    fn indicators(&self) -> IndicatorState {
        self.outputs.lock().1
    }

    fn position(&self) -> GatePosition {
        self.outputs.lock().0
    }

    fn name(&self) -> &'static str {
        "blocking_open"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_during_open_command_leaves_gate_closed() {
    for _ in 0..20 {
        let actuator = Arc::new(BlockingOpenActuator::new());
        let handle = GateSupervisor::spawn(
            &test_config(),
            Arc::new(ScriptedAuthorizer::new(AuthorizationOutcome::Authorized, Duration::ZERO)),
            actuator.clone(),
            Arc::new(Metrics::new()),
            None,
        );

        let mut state = handle.state_watch();
        handle.submit_plate(PLATE);
        state.wait_for(|s| *s == GateState::Opening).await.unwrap();

        handle.shutdown().await;

        assert_eq!(handle.state(), GateState::Closed);
        assert_eq!(actuator.position(), GatePosition::Closed);
        assert!(actuator.indicators().red());
        assert!(!actuator.indicators().green());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_malformed_plates_never_authorized(
        raw in "[A-Z0-9-]{0,8}[a-z !#._/]{1,3}[A-Z0-9-]{0,8}"
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let calls = rt.block_on(async {
            let h = harness(AuthorizationOutcome::Authorized, millis(10));
            h.handle.submit_plate(raw.clone());
            h.handle.shutdown().await;
            h.authorizer.calls()
        });
        prop_assert_eq!(calls, 0);
    }
}
