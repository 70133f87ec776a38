//! One request/response cycle as an explicit state machine.
//!
//! `StreamSession` owns the turn's `Accumulator` and throughput estimator.
//! Its synchronous methods (`handle`, `fail`, `cancel`) are the transitions;
//! `drive` pumps an endpoint's event source through them on a single task.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::accumulator::Accumulator;
use crate::config::PartialContentPolicy;
use crate::endpoint::{GenerationEndpoint, GenerationRequest};
use crate::errors::{ProtocolViolation, TransportError, TurnFailure};
use crate::event::{FinalizationStats, StreamEvent};
use crate::message::{FinalizedMessage, Termination};
use crate::throughput::{ThroughputEstimator, estimate_tokens};

/// Lifecycle of a stream session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Opening,
    Streaming,
    Finalizing,
    Cancelling,
    Failing,
    Closed,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Opening => "opening",
            Self::Streaming => "streaming",
            Self::Finalizing => "finalizing",
            Self::Cancelling => "cancelling",
            Self::Failing => "failing",
            Self::Closed => "closed",
        }
    }
}

/// Read-only view of a turn for rendering.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnSnapshot {
    pub turn_id: uuid::Uuid,
    pub state: SessionState,
    pub answer_text: String,
    pub reasoning_text: String,
    pub current_rate: Option<f64>,
    pub is_active: bool,
}

/// Result of a closed session.
#[derive(Clone, Debug, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: uuid::Uuid,
    pub termination: Termination,
    /// The assistant message to commit, if the turn produced one.
    pub message: Option<FinalizedMessage>,
    /// Present only when the turn ended with `done`.
    pub stats: Option<FinalizationStats>,
}

/// What `StreamSession::handle` did with an event.
#[derive(Debug)]
pub enum Step {
    /// The event was applied and the session keeps streaming.
    Continue,
    /// The event was terminal; the session is now closed.
    Closed(TurnOutcome),
    /// The event arrived after the session closed and was dropped.
    Ignored(ProtocolViolation),
}

pub type SnapshotSender = Arc<watch::Sender<Option<TurnSnapshot>>>;

/// State machine for a single turn. Never reused once closed.
pub struct StreamSession {
    turn_id: uuid::Uuid,
    state: SessionState,
    turn: Option<Accumulator>,
    throughput: ThroughputEstimator,
    started: Instant,
    policy: PartialContentPolicy,
    updates: SnapshotSender,
}

impl StreamSession {
    pub fn new(turn_id: uuid::Uuid, policy: PartialContentPolicy, updates: SnapshotSender) -> Self {
        Self {
            turn_id,
            state: SessionState::Idle,
            turn: None,
            throughput: ThroughputEstimator::new(),
            started: Instant::now(),
            policy,
            updates,
        }
    }

    pub fn turn_id(&self) -> uuid::Uuid {
        self.turn_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// `Idle -> Opening`: creates a fresh turn and publishes it.
    pub fn begin_open(&mut self) -> Result<(), ProtocolViolation> {
        if self.state != SessionState::Idle {
            return Err(ProtocolViolation {
                event: "open",
                state: self.state.as_str(),
            });
        }
        self.turn = Some(Accumulator::new());
        self.started = Instant::now();
        self.transition(SessionState::Opening);
        self.publish();
        Ok(())
    }

    /// Applies one decoded event.
    pub fn handle(&mut self, event: StreamEvent) -> Step {
        let Some(turn) = self.turn.as_mut() else {
            let violation = ProtocolViolation {
                event: event.tag(),
                state: self.state.as_str(),
            };
            warn!(turn_id = %self.turn_id, error = %violation, "dropping stream event");
            return Step::Ignored(violation);
        };
        if let Err(violation) = turn.apply(&event) {
            warn!(turn_id = %self.turn_id, error = %violation, "dropping stream event");
            return Step::Ignored(violation);
        }
        if self.state == SessionState::Opening {
            self.transition(SessionState::Streaming);
        }

        match event {
            StreamEvent::Thinking { .. } => {
                self.publish();
                Step::Continue
            }
            StreamEvent::Token {
                tokens_per_second, ..
            } => {
                let tokens = self
                    .turn
                    .as_ref()
                    .map_or(0, |turn| estimate_tokens(turn.answer_text()));
                let delta = tokens.saturating_sub(self.throughput.observed_tokens());
                self.throughput
                    .observe(delta, self.started.elapsed().as_millis() as u64);
                if let Some(rate) = tokens_per_second {
                    self.throughput.report(rate);
                }
                self.publish();
                Step::Continue
            }
            StreamEvent::Done(stats) => {
                self.transition(SessionState::Finalizing);
                Step::Closed(self.close(Termination::Completed, Some(stats)))
            }
            StreamEvent::Error { message } => {
                self.transition(SessionState::Failing);
                let failure = TurnFailure::Upstream { message };
                Step::Closed(self.close(Termination::Failed { failure }, None))
            }
        }
    }

    /// Ends the turn because the transport failed or the stream ran dry.
    pub fn fail(&mut self, failure: TurnFailure) -> Result<TurnOutcome, ProtocolViolation> {
        self.ensure_open("fail")?;
        self.transition(SessionState::Failing);
        if let Some(turn) = self.turn.as_mut() {
            turn.deactivate();
        }
        Ok(self.close(Termination::Failed { failure }, None))
    }

    /// Ends the turn on the caller's request. No statistics are computed.
    pub fn cancel(&mut self) -> Result<TurnOutcome, ProtocolViolation> {
        self.ensure_open("cancel")?;
        self.transition(SessionState::Cancelling);
        if let Some(turn) = self.turn.as_mut() {
            turn.deactivate();
        }
        Ok(self.close(Termination::Cancelled, None))
    }

    /// Current view of the turn; `None` once the turn has been discarded.
    pub fn snapshot(&self) -> Option<TurnSnapshot> {
        let turn = self.turn.as_ref()?;
        let current_rate = turn.current_rate().or_else(|| {
            let computed = self.throughput.instantaneous();
            (computed > 0.0).then_some(computed)
        });
        Some(TurnSnapshot {
            turn_id: self.turn_id,
            state: self.state,
            answer_text: turn.answer_text().to_string(),
            reasoning_text: turn.reasoning_text().to_string(),
            current_rate,
            is_active: turn.is_active(),
        })
    }

    /// Opens the endpoint and consumes its events until the turn closes.
    ///
    /// Cancellation is checked before every event, so once `cancel_rx` flips
    /// (or its sender is dropped) no buffered event is processed.
    pub async fn drive(
        mut self,
        endpoint: Arc<dyn GenerationEndpoint>,
        request: GenerationRequest,
        open_timeout: Option<Duration>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> TurnOutcome {
        if self.state == SessionState::Idle {
            let _ = self.begin_open();
        }

        let open = async move {
            match open_timeout {
                Some(limit) => tokio::time::timeout(limit, endpoint.open(request))
                    .await
                    .unwrap_or_else(|_| {
                        Err(TransportError::OpenTimeout {
                            elapsed_ms: limit.as_millis() as u64,
                        })
                    }),
                None => endpoint.open(request).await,
            }
        };
        let opened = tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => return self.cancel_or_closed(),
            opened = open => opened,
        };
        let mut source = match opened {
            Ok(source) => source,
            Err(err) => {
                warn!(turn_id = %self.turn_id, error = %err, "failed to open event stream");
                return self.fail_or_closed(TurnFailure::from(&err));
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel_rx) => {
                    drop(source);
                    return self.cancel_or_closed();
                }
                next = source.next() => match next {
                    // Cancellation may land while the source is being polled.
                    Some(Ok(_)) if cancel_requested(&cancel_rx) => {
                        drop(source);
                        return self.cancel_or_closed();
                    }
                    Some(Ok(event)) => {
                        if let Step::Closed(outcome) = self.handle(event) {
                            return outcome;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(turn_id = %self.turn_id, error = %err, "event stream failed");
                        return self.fail_or_closed(TurnFailure::from(&err));
                    }
                    None => {
                        return self.fail_or_closed(TurnFailure::Protocol {
                            message: "event stream ended without a terminal event".into(),
                        });
                    }
                }
            }
        }
    }

    fn cancel_or_closed(&mut self) -> TurnOutcome {
        self.cancel().unwrap_or_else(|_| self.closed_outcome())
    }

    fn fail_or_closed(&mut self, failure: TurnFailure) -> TurnOutcome {
        self.fail(failure).unwrap_or_else(|_| self.closed_outcome())
    }

    fn closed_outcome(&self) -> TurnOutcome {
        TurnOutcome {
            turn_id: self.turn_id,
            termination: Termination::Failed {
                failure: TurnFailure::Protocol {
                    message: "session already closed".into(),
                },
            },
            message: None,
            stats: None,
        }
    }

    fn ensure_open(&self, action: &'static str) -> Result<(), ProtocolViolation> {
        match self.state {
            SessionState::Opening | SessionState::Streaming => Ok(()),
            state => Err(ProtocolViolation {
                event: action,
                state: state.as_str(),
            }),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(turn_id = %self.turn_id, from = self.state.as_str(), to = next.as_str(), "session transition");
        self.state = next;
    }

    fn publish(&self) {
        if let Some(snapshot) = self.snapshot() {
            self.updates.send_replace(Some(snapshot));
        }
    }

    /// Publishes the last view, discards the turn, and builds the outcome.
    fn close(&mut self, termination: Termination, stats: Option<FinalizationStats>) -> TurnOutcome {
        self.publish();
        let (answer, reasoning) = self
            .turn
            .take()
            .map(Accumulator::into_texts)
            .unwrap_or_default();

        let keep = match (&termination, self.policy) {
            (Termination::Completed, _) => true,
            (_, PartialContentPolicy::Preserve) => !answer.is_empty(),
            (_, PartialContentPolicy::Discard) => false,
        };
        let message = keep.then(|| {
            FinalizedMessage::assistant(
                self.turn_id,
                answer,
                reasoning,
                termination.clone(),
                stats.clone(),
            )
        });

        self.transition(SessionState::Closed);
        let last = self.updates.borrow().clone();
        if let Some(snapshot) = last {
            let closed = TurnSnapshot {
                state: SessionState::Closed,
                is_active: false,
                ..snapshot
            };
            self.updates.send_replace(Some(closed));
        }
        TurnOutcome {
            turn_id: self.turn_id,
            termination,
            message,
            stats,
        }
    }
}

fn cancel_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

/// Resolves once cancellation is requested or the requester went away.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
