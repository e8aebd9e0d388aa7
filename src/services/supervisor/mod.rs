//! Gate supervisor - owns gate state and sequences authorization and actuation
//!
//! A single task processes every event, so at most one authorization request
//! and one actuation command are ever in flight. The task keeps draining its
//! event channel while busy so that plates arriving mid-cycle are dropped
//! rather than queued.
//!
//! State machine:
//! - Closed --plate--> AwaitingAuthorization
//! - AwaitingAuthorization --Authorized--> Opening
//! - AwaitingAuthorization --any other outcome--> Closed (fail-closed)
//! - Opening --actuation complete--> Open (auto-close timer armed)
//! - Open --timer or explicit close--> Closing
//! - Closing --actuation complete--> Closed

use crate::domain::decision::DecisionRecord;
use crate::domain::types::{
    AuthorizationOutcome, GatePosition, GateState, GateTransition, IndicatorState,
    PlateIdentifier,
};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::actuator::Actuator;
use crate::io::controller::Authorizer;
use crate::io::decision_log::DecisionSender;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, error, info, warn};

/// Extra time granted to the authorizer beyond its own deadline before the
/// supervisor aborts it
const WATCHDOG_GRACE: Duration = Duration::from_millis(250);

const EVENT_CHANNEL_SIZE: usize = 64;
const TRANSITION_CHANNEL_SIZE: usize = 64;

/// Inputs to the supervisor task
#[derive(Debug)]
pub enum GateEvent {
    /// Raw plate text from the recognizer, stamped on receipt
    PlateRecognized { raw: String, received_at: Instant },
    /// Close now (operator or exit loop)
    CloseTrigger,
    Shutdown { done: oneshot::Sender<()> },
}

/// In-flight authorization request
struct PendingAuth {
    plate: PlateIdentifier,
    started: Instant,
    handle: JoinHandle<AuthorizationOutcome>,
    watchdog: Pin<Box<Sleep>>,
}

enum AuthResolution {
    Completed(Result<AuthorizationOutcome, JoinError>),
    WatchdogFired,
}

/// Resolve the pending request, or never if there is none
async fn resolve_pending(pending: &mut Option<PendingAuth>) -> AuthResolution {
    match pending {
        Some(p) => tokio::select! {
            biased;
            result = &mut p.handle => AuthResolution::Completed(result),
            _ = p.watchdog.as_mut() => AuthResolution::WatchdogFired,
        },
        None => std::future::pending().await,
    }
}

async fn join_actuation(actuation: &mut Option<JoinHandle<()>>) -> Result<(), JoinError> {
    match actuation {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Cloneable handle for feeding events to and observing the supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    event_tx: mpsc::Sender<GateEvent>,
    state_rx: watch::Receiver<GateState>,
    transitions: broadcast::Sender<GateTransition>,
    actuator: Arc<dyn Actuator>,
}

impl SupervisorHandle {
    /// Deliver a recognized plate. Returns false if the event could not be queued.
    pub fn submit_plate(&self, raw: impl Into<String>) -> bool {
        let event = GateEvent::PlateRecognized { raw: raw.into(), received_at: Instant::now() };
        match self.event_tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "plate_event_not_queued");
                false
            }
        }
    }

    /// Explicit close trigger
    pub async fn close(&self) {
        if self.event_tx.send(GateEvent::CloseTrigger).await.is_err() {
            debug!("close_trigger_after_shutdown");
        }
    }

    /// Force the gate closed, cancel any pending work and stop the supervisor
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.event_tx.send(GateEvent::Shutdown { done: done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn state(&self) -> GateState {
        *self.state_rx.borrow()
    }

    /// Watch channel of the current state
    pub fn state_watch(&self) -> watch::Receiver<GateState> {
        self.state_rx.clone()
    }

    /// Stream of transitions from now on
    pub fn subscribe(&self) -> broadcast::Receiver<GateTransition> {
        self.transitions.subscribe()
    }

    pub fn indicators(&self) -> IndicatorState {
        self.actuator.indicators()
    }
}

/// Single-flight gate state machine
pub struct GateSupervisor {
    authorizer: Arc<dyn Authorizer>,
    actuator: Arc<dyn Actuator>,
    metrics: Arc<Metrics>,
    decisions: Option<DecisionSender>,
    deadline: Duration,
    auto_close: Duration,
    plate_max_len: usize,
    state: GateState,
    /// When the gate last became idle; plates received earlier arrived mid-cycle
    idle_since: Instant,
    /// Close requested while opening, executed once open
    close_latched: bool,
    opened_at: Option<Instant>,
    pending_auth: Option<PendingAuth>,
    actuation: Option<JoinHandle<()>>,
    auto_close_timer: Option<Pin<Box<Sleep>>>,
    state_tx: watch::Sender<GateState>,
    transitions: broadcast::Sender<GateTransition>,
}

impl GateSupervisor {
    /// Start the supervisor task with the gate closed
    pub fn spawn(
        config: &Config,
        authorizer: Arc<dyn Authorizer>,
        actuator: Arc<dyn Actuator>,
        metrics: Arc<Metrics>,
        decisions: Option<DecisionSender>,
    ) -> SupervisorHandle {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(GateState::Closed);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_SIZE);

        metrics.set_gate_state(GateState::Closed);

        let supervisor = Self {
            authorizer,
            actuator: actuator.clone(),
            metrics,
            decisions,
            deadline: config.controller_deadline(),
            auto_close: config.auto_close(),
            plate_max_len: config.plate_max_len(),
            state: GateState::Closed,
            idle_since: Instant::now(),
            close_latched: false,
            opened_at: None,
            pending_auth: None,
            actuation: None,
            auto_close_timer: None,
            state_tx,
            transitions: transitions.clone(),
        };

        info!(
            deadline_ms = %supervisor.deadline.as_millis(),
            auto_close_ms = %supervisor.auto_close.as_millis(),
            actuator = %actuator.name(),
            "supervisor_started"
        );

        tokio::spawn(supervisor.run(event_rx));

        SupervisorHandle { event_tx, state_rx, transitions, actuator }
    }

    async fn run(mut self, mut event_rx: mpsc::Receiver<GateEvent>) {
        // Force a known actuator state before accepting events
        self.actuator.set_position(GatePosition::Closed).await;

        loop {
            tokio::select! {
                // Events first: an explicit close beats a simultaneous timer expiry
                biased;

                event = event_rx.recv() => match event {
                    Some(GateEvent::Shutdown { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("supervisor_event_channel_closed");
                        self.shutdown().await;
                        break;
                    }
                },
                resolution = resolve_pending(&mut self.pending_auth) => {
                    self.on_authorization(resolution).await;
                }
                result = join_actuation(&mut self.actuation) => {
                    self.actuation = None;
                    self.on_actuation_complete(result);
                }
                _ = wait_timer(&mut self.auto_close_timer) => {
                    self.auto_close_timer = None;
                    if self.state == GateState::Open {
                        self.begin_closing("auto_close");
                    }
                }
            }
        }

        info!("supervisor_stopped");
    }

    fn handle_event(&mut self, event: GateEvent) {
        match event {
            GateEvent::PlateRecognized { raw, received_at } => self.on_plate(raw, received_at),
            GateEvent::CloseTrigger => self.on_close_trigger(),
            GateEvent::Shutdown { .. } => {}
        }
    }

    fn on_plate(&mut self, raw: String, received_at: Instant) {
        self.metrics.record_plate_received();

        if self.state != GateState::Closed || received_at < self.idle_since {
            self.metrics.record_plate_dropped_busy();
            warn!(raw = %raw, state = %self.state, "plate_dropped_busy");
            return;
        }

        let plate = match PlateIdentifier::parse(&raw, self.plate_max_len) {
            Ok(plate) => plate,
            Err(e) => {
                self.metrics.record_plate_rejected();
                warn!(raw = ?raw, error = %e, "plate_rejected");
                return;
            }
        };

        info!(plate = %plate, "plate_recognized");
        self.transition(GateState::AwaitingAuthorization);

        let authorizer = self.authorizer.clone();
        let request_plate = plate.clone();
        let deadline = self.deadline;
        let handle = tokio::spawn(async move {
            authorizer.request_authorization(&request_plate, deadline).await
        });

        self.pending_auth = Some(PendingAuth {
            plate,
            started: Instant::now(),
            handle,
            watchdog: Box::pin(sleep(deadline + WATCHDOG_GRACE)),
        });
    }

    async fn on_authorization(&mut self, resolution: AuthResolution) {
        let Some(pending) = self.pending_auth.take() else {
            return;
        };

        let outcome = match resolution {
            AuthResolution::Completed(Ok(outcome)) => outcome,
            AuthResolution::Completed(Err(e)) => {
                error!(plate = %pending.plate, error = %e, "authorizer_task_failed");
                AuthorizationOutcome::ControllerUnavailable
            }
            AuthResolution::WatchdogFired => {
                // Any answer that arrives after this point is discarded with the task
                pending.handle.abort();
                warn!(plate = %pending.plate, "authorization_watchdog_fired");
                AuthorizationOutcome::Timeout
            }
        };

        let latency_ms = pending.started.elapsed().as_millis() as u64;
        self.metrics.record_authorization(outcome, latency_ms);
        log_outcome(&pending.plate, outcome, latency_ms);

        if let Some(decisions) = &self.decisions {
            decisions.send(DecisionRecord::new(pending.plate, outcome, latency_ms));
        }

        if outcome.is_authorized() {
            self.transition(GateState::Opening);
            self.start_actuation(GatePosition::Open);
        } else {
            // Fail-closed: re-assert closed and the red lamp
            self.actuator.set_position(GatePosition::Closed).await;
            self.become_idle();
        }
    }

    fn on_actuation_complete(&mut self, result: Result<(), JoinError>) {
        if let Err(e) = result {
            error!(state = %self.state, error = %e, "actuation_task_failed");
        }

        match self.state {
            GateState::Opening => {
                self.transition(GateState::Open);
                self.opened_at = Some(Instant::now());
                if std::mem::take(&mut self.close_latched) {
                    self.begin_closing("latched_close");
                } else {
                    self.auto_close_timer = Some(Box::pin(sleep(self.auto_close)));
                }
            }
            GateState::Closing => {
                self.auto_close_timer = None;
                let open_ms =
                    self.opened_at.take().map(|t| t.elapsed().as_millis() as u64).unwrap_or(0);
                self.metrics.record_gate_cycle();
                info!(open_ms = %open_ms, "gate_cycle_complete");
                self.become_idle();
            }
            state => {
                debug!(state = %state, "actuation_complete_ignored");
            }
        }
    }

    fn on_close_trigger(&mut self) {
        match self.state {
            GateState::Open => {
                self.auto_close_timer = None;
                self.begin_closing("explicit");
            }
            GateState::Opening => {
                self.close_latched = true;
                info!("close_latched_while_opening");
            }
            state => {
                debug!(state = %state, "close_trigger_ignored");
            }
        }
    }

    fn begin_closing(&mut self, reason: &'static str) {
        self.transition(GateState::Closing);
        info!(reason = %reason, "gate_closing");
        self.start_actuation(GatePosition::Closed);
    }

    fn start_actuation(&mut self, target: GatePosition) {
        if let Some(previous) = self.actuation.take() {
            // Cannot happen while transitions are sequenced, but never overlap commands
            error!(target = %target.as_str(), "actuation_overlap_aborted");
            previous.abort();
        }
        let actuator = self.actuator.clone();
        self.actuation = Some(tokio::spawn(async move { actuator.set_position(target).await }));
    }

    fn become_idle(&mut self) {
        self.idle_since = Instant::now();
        self.transition(GateState::Closed);
    }

    async fn shutdown(&mut self) {
        // Aborted tasks are joined so a command already mid-poll cannot land
        // after the forced close below
        if let Some(pending) = self.pending_auth.take() {
            pending.handle.abort();
            let _ = pending.handle.await;
            info!(plate = %pending.plate, "authorization_cancelled");
        }
        if let Some(actuation) = self.actuation.take() {
            actuation.abort();
            let _ = actuation.await;
        }
        self.auto_close_timer = None;
        self.close_latched = false;
        self.opened_at = None;

        self.actuator.set_position(GatePosition::Closed).await;
        if self.state != GateState::Closed {
            self.transition(GateState::Closed);
        }
        info!("supervisor_shutdown_gate_closed");
    }

    fn transition(&mut self, to: GateState) {
        let from = self.state;
        self.state = to;
        self.metrics.set_gate_state(to);
        self.state_tx.send_replace(to);
        let _ = self.transitions.send(GateTransition { from, to, at: Instant::now() });
        debug!(from = %from, to = %to, "gate_state_changed");
    }
}

/// Every failure takes the same fail-closed path; only the log differs
fn log_outcome(plate: &PlateIdentifier, outcome: AuthorizationOutcome, latency_ms: u64) {
    match outcome {
        AuthorizationOutcome::Authorized => {
            info!(plate = %plate, latency_ms = %latency_ms, "authorization_granted");
        }
        AuthorizationOutcome::Denied => {
            info!(plate = %plate, latency_ms = %latency_ms, "authorization_denied");
        }
        AuthorizationOutcome::Timeout => {
            warn!(plate = %plate, latency_ms = %latency_ms, fail_closed = true, "authorization_timeout");
        }
        AuthorizationOutcome::ControllerUnavailable => {
            error!(
                plate = %plate,
                latency_ms = %latency_ms,
                fail_closed = true,
                "authorization_controller_unavailable"
            );
        }
        AuthorizationOutcome::MalformedResponse => {
            error!(
                plate = %plate,
                latency_ms = %latency_ms,
                fail_closed = true,
                "authorization_malformed_response"
            );
        }
    }
}

#[cfg(test)]
mod tests;
