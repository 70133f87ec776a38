use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::config::{PartialContentPolicy, SupervisorConfig};
use crate::endpoint::{GenerationEndpoint, GenerationRequest};
use crate::errors::{SupervisorError, TurnFailure};
use crate::event::FinalizationStats;
use crate::history::HistorySink;
use crate::message::{FinalizedMessage, Termination};
use crate::session::{SnapshotSender, StreamSession, TurnOutcome, TurnSnapshot};

/// Handle used to request cancellation of the active turn from elsewhere
/// (for example a Ctrl-C handler).
#[derive(Clone)]
pub struct AbortHandle {
    turn_id: uuid::Uuid,
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn turn_id(&self) -> uuid::Uuid {
        self.turn_id
    }

    /// Requests cancellation. The turn closes before processing any further
    /// event and commits whatever it kept.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

struct ActiveTurn {
    turn_id: uuid::Uuid,
    abort: AbortHandle,
    outcome_rx: oneshot::Receiver<TurnOutcome>,
}

#[derive(Default)]
struct Ledger {
    history: Vec<FinalizedMessage>,
    streaming: Option<uuid::Uuid>,
    last_stats: Option<FinalizationStats>,
}

/// Conversation state shared with the task that drives the active turn, so a
/// closing turn commits itself without waiting for the supervisor's owner.
#[derive(Clone)]
struct Conversation {
    ledger: Arc<Mutex<Ledger>>,
    sink: Option<Arc<dyn HistorySink>>,
    updates: SnapshotSender,
}

impl Conversation {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn forward(&self, message: FinalizedMessage) {
        if let Some(sink) = self.sink.as_ref()
            && let Err(err) = sink.append(message).await
        {
            warn!(error = %err, "history sink rejected message");
        }
    }

    /// Sink first, then local history, then back to idle: once the snapshot
    /// channel reads `None`, the turn is visible everywhere.
    async fn commit(&self, outcome: &TurnOutcome) {
        let streaming = self.ledger().streaming;
        if streaming != Some(outcome.turn_id) {
            warn!(turn_id = %outcome.turn_id, "turn already committed");
            return;
        }
        if let Some(message) = &outcome.message {
            self.forward(message.clone()).await;
        }
        {
            let mut ledger = self.ledger();
            if let Some(message) = &outcome.message {
                ledger.history.push(message.clone());
            }
            ledger.last_stats = outcome.stats.clone();
            ledger.streaming = None;
        }
        self.updates.send_replace(None);
        info!(
            turn_id = %outcome.turn_id,
            termination = ?outcome.termination,
            committed = outcome.message.is_some(),
            "turn closed"
        );
    }
}

/// Entry point for the UI: submits messages, exposes the live turn, and owns
/// the conversation history this core appends to.
///
/// At most one turn streams at a time. The task driving a turn commits its
/// message as soon as the turn closes; `wait_active` only joins it.
pub struct Supervisor {
    endpoint: Arc<dyn GenerationEndpoint>,
    config: SupervisorConfig,
    conversation: Conversation,
    active: Option<ActiveTurn>,
}

impl Supervisor {
    pub fn new(endpoint: Arc<dyn GenerationEndpoint>, config: SupervisorConfig) -> Self {
        Self {
            endpoint,
            config,
            conversation: Conversation {
                ledger: Arc::new(Mutex::new(Ledger::default())),
                sink: None,
                updates: Arc::new(watch::channel(None).0),
            },
            active: None,
        }
    }

    /// Forwards every appended message to `sink` as well.
    pub fn with_history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.conversation.sink = Some(sink);
        self
    }

    /// Appends the user's message and starts streaming the reply.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn submit(&mut self, user_text: impl Into<String>) -> Result<uuid::Uuid, SupervisorError> {
        self.poll_active().await;
        let streaming = self.conversation.ledger().streaming;
        if let Some(turn_id) = streaming {
            return Err(SupervisorError::AlreadyStreaming { turn_id });
        }
        let text = user_text.into();
        if text.trim().is_empty() {
            return Err(SupervisorError::Validation(
                "message must not be empty".into(),
            ));
        }

        let turn_id = uuid::Uuid::new_v4();
        let user = FinalizedMessage::user(text.clone());
        {
            let mut ledger = self.conversation.ledger();
            ledger.history.push(user.clone());
            ledger.streaming = Some(turn_id);
        }
        self.conversation.forward(user).await;

        let mut session = StreamSession::new(
            turn_id,
            self.config.partial_content,
            self.conversation.updates.clone(),
        );
        if let Err(violation) = session.begin_open() {
            warn!(turn_id = %turn_id, error = %violation, "fresh session refused to open");
        }

        let (abort_tx, abort_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let request = GenerationRequest {
            turn_id,
            message: text,
            conversation_id: self.config.conversation_id.clone(),
        };
        let endpoint = self.endpoint.clone();
        let open_timeout = self.config.open_timeout;
        let conversation = self.conversation.clone();
        tokio::spawn(async move {
            let outcome = session.drive(endpoint, request, open_timeout, abort_rx).await;
            conversation.commit(&outcome).await;
            let _ = outcome_tx.send(outcome);
        });

        self.active = Some(ActiveTurn {
            turn_id,
            abort: AbortHandle {
                turn_id,
                tx: abort_tx,
            },
            outcome_rx,
        });
        info!(turn_id = %turn_id, "turn started");
        Ok(turn_id)
    }

    /// Snapshot of the active turn, or `None` when idle.
    pub fn current_partial_state(&self) -> Option<TurnSnapshot> {
        self.conversation.updates.borrow().clone()
    }

    /// Receiver that changes on every published snapshot; `None` means idle
    /// and the last turn is already in `history()`.
    pub fn subscribe(&self) -> watch::Receiver<Option<TurnSnapshot>> {
        self.conversation.updates.subscribe()
    }

    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.active.as_ref().map(|active| active.abort.clone())
    }

    pub fn is_streaming(&self) -> bool {
        self.conversation.ledger().streaming.is_some()
    }

    /// Cancels the active turn, if any, and returns how it ended. A turn that
    /// closed before the request keeps its original outcome.
    pub async fn cancel_active(&mut self) -> Option<TurnOutcome> {
        let active = self.active.take()?;
        active.abort.abort();
        Some(self.join(active).await)
    }

    /// Waits for the active turn to close and returns its outcome.
    pub async fn wait_active(&mut self) -> Option<TurnOutcome> {
        let active = self.active.take()?;
        Some(self.join(active).await)
    }

    /// Outcome of the active turn if it has already closed; never waits.
    pub async fn poll_active(&mut self) -> Option<TurnOutcome> {
        let active = self.active.as_mut()?;
        let turn_id = active.turn_id;
        let outcome = match active.outcome_rx.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => self.recover_lost(turn_id).await,
        };
        self.active = None;
        Some(outcome)
    }

    /// Copy of the local append-only history, oldest first.
    pub fn history(&self) -> Vec<FinalizedMessage> {
        self.conversation.ledger().history.clone()
    }

    /// Statistics of the most recently closed turn, if it completed.
    pub fn last_stats(&self) -> Option<FinalizationStats> {
        self.conversation.ledger().last_stats.clone()
    }

    async fn join(&self, active: ActiveTurn) -> TurnOutcome {
        let turn_id = active.turn_id;
        match active.outcome_rx.await {
            Ok(outcome) => outcome,
            Err(_) => self.recover_lost(turn_id).await,
        }
    }

    /// The driving task died without reporting; salvage the last snapshot and
    /// commit in its place.
    async fn recover_lost(&self, turn_id: uuid::Uuid) -> TurnOutcome {
        warn!(turn_id = %turn_id, "stream task ended without an outcome");
        let failure = TurnFailure::Protocol {
            message: "stream task ended without an outcome".into(),
        };
        let termination = Termination::Failed { failure };
        let last = self
            .conversation
            .updates
            .borrow()
            .clone()
            .filter(|snapshot| snapshot.turn_id == turn_id);
        let message = match (last, self.config.partial_content) {
            (Some(snapshot), PartialContentPolicy::Preserve) if !snapshot.answer_text.is_empty() => {
                Some(FinalizedMessage::assistant(
                    turn_id,
                    snapshot.answer_text,
                    snapshot.reasoning_text,
                    termination.clone(),
                    None,
                ))
            }
            _ => None,
        };
        let outcome = TurnOutcome {
            turn_id,
            termination,
            message,
            stats: None,
        };
        self.conversation.commit(&outcome).await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use futures::StreamExt as _;
    use futures::stream;

    use super::*;
    use crate::decoder::decode_byte_stream;
    use crate::endpoint::EventSource;
    use crate::errors::TransportError;
    use crate::event::StreamEvent;
    use crate::history::MemoryHistory;
    use crate::message::Role;
    use crate::session::SessionState;

    enum Script {
        Events(Vec<Result<StreamEvent, TransportError>>),
        EventsThenPending(Vec<StreamEvent>),
        /// Raw server-sent-event bytes, decoded the same way as over HTTP.
        Frames(Vec<&'static str>),
    }

    struct FakeEndpoint {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    impl FakeEndpoint {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl GenerationEndpoint for FakeEndpoint {
        async fn open(&self, request: GenerationRequest) -> Result<EventSource, TransportError> {
            self.requests.lock().expect("lock").push(request);
            let script = self.scripts.lock().expect("lock").pop_front();
            match script {
                Some(Script::Events(events)) => Ok(Box::pin(stream::iter(events))),
                Some(Script::EventsThenPending(events)) => Ok(Box::pin(
                    stream::iter(events.into_iter().map(Ok::<_, TransportError>))
                        .chain(stream::pending::<Result<StreamEvent, TransportError>>()),
                )),
                Some(Script::Frames(frames)) => Ok(Box::pin(decode_byte_stream(stream::iter(
                    frames
                        .into_iter()
                        .map(|frame| Ok::<_, std::convert::Infallible>(frame.as_bytes())),
                )))),
                None => Err(TransportError::connect("no scripted response")),
            }
        }
    }

    fn supervisor(endpoint: Arc<FakeEndpoint>) -> Supervisor {
        Supervisor::new(endpoint, SupervisorConfig::default())
    }

    async fn wait_for_answer(supervisor: &Supervisor, text: &str) {
        let mut rx = supervisor.subscribe();
        rx.wait_for(|s| s.as_ref().is_some_and(|s| s.answer_text == text))
            .await
            .expect("snapshot");
    }

    /// Resolves once the active turn has been committed.
    async fn wait_idle(supervisor: &Supervisor) {
        let mut rx = supervisor.subscribe();
        rx.wait_for(Option::is_none).await.expect("idle");
    }

    fn contents(supervisor: &Supervisor) -> Vec<(Role, String)> {
        supervisor
            .history()
            .into_iter()
            .map(|m| (m.role, m.content))
            .collect()
    }

    #[tokio::test]
    async fn streams_and_commits_finalized_message() {
        let endpoint = FakeEndpoint::new(vec![Script::Events(vec![
            Ok(StreamEvent::token("Hel")),
            Ok(StreamEvent::token("lo")),
            Ok(StreamEvent::done(2, 1000, 2.0)),
        ])]);
        let mut sup = supervisor(endpoint);
        assert!(sup.current_partial_state().is_none());

        let turn_id = sup.submit("hi").await.expect("submit");
        assert!(sup.is_streaming());

        let outcome = sup.wait_active().await.expect("outcome");
        assert_eq!(outcome.turn_id, turn_id);
        assert_eq!(
            contents(&sup),
            vec![
                (Role::User, "hi".to_string()),
                (Role::Assistant, "Hello".to_string())
            ]
        );
        assert_eq!(
            sup.last_stats(),
            Some(FinalizationStats {
                total_tokens: 2,
                duration_ms: 1000,
                avg_tokens_per_second: 2.0,
            })
        );
        assert!(sup.current_partial_state().is_none());
        assert!(!sup.is_streaming());
    }

    #[tokio::test]
    async fn closed_turn_commits_without_being_joined() {
        let sink = MemoryHistory::new();
        let endpoint = FakeEndpoint::new(vec![Script::Events(vec![
            Ok(StreamEvent::token("Hello")),
            Ok(StreamEvent::done(1, 100, 10.0)),
        ])]);
        let mut sup = supervisor(endpoint).with_history_sink(Arc::new(sink.clone()));
        sup.submit("hi").await.expect("submit");

        wait_idle(&sup).await;
        assert_eq!(sup.history().len(), 2);
        assert_eq!(sink.len(), 2);
        assert!(!sup.is_streaming());
        assert!(sup.current_partial_state().is_none());
        assert!(sup.last_stats().is_some());
    }

    #[tokio::test]
    async fn late_subscriber_sees_idle_after_turn_closed() {
        let mut sup = supervisor(FakeEndpoint::new(vec![Script::Events(vec![Ok(
            StreamEvent::done(0, 0, 0.0),
        )])]));
        sup.submit("hi").await.expect("submit");
        wait_idle(&sup).await;

        let mut rx = sup.subscribe();
        rx.mark_changed();
        rx.changed().await.expect("sender alive");
        assert!(rx.borrow_and_update().is_none());
    }

    #[tokio::test]
    async fn submit_while_streaming_is_rejected() {
        let endpoint = FakeEndpoint::new(vec![Script::EventsThenPending(vec![])]);
        let mut sup = supervisor(endpoint.clone());
        let turn_id = sup.submit("first").await.expect("submit");

        let err = sup.submit("second").await.expect_err("must reject");
        assert_eq!(err, SupervisorError::AlreadyStreaming { turn_id });
        assert_eq!(contents(&sup), vec![(Role::User, "first".to_string())]);

        sup.cancel_active().await.expect("cancel");
        // The rejected submit never reached the endpoint.
        assert!(endpoint.requests.lock().expect("lock").len() <= 1);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let mut sup = supervisor(FakeEndpoint::new(vec![]));
        let err = sup.submit("   ").await.expect_err("must reject");
        assert!(matches!(err, SupervisorError::Validation(_)));
        assert!(sup.history().is_empty());
    }

    #[tokio::test]
    async fn cancel_with_no_content_appends_nothing() {
        let mut sup = supervisor(FakeEndpoint::new(vec![Script::EventsThenPending(vec![])]));
        sup.submit("hello?").await.expect("submit");
        let outcome = sup.cancel_active().await.expect("outcome");
        assert_eq!(outcome.termination, Termination::Cancelled);
        assert_eq!(contents(&sup), vec![(Role::User, "hello?".to_string())]);
        assert!(sup.last_stats().is_none());
        assert!(!sup.is_streaming());
    }

    #[tokio::test]
    async fn cancel_with_content_appends_one_message_without_stats() {
        let mut sup = supervisor(FakeEndpoint::new(vec![Script::EventsThenPending(vec![
            StreamEvent::thinking("pondering"),
            StreamEvent::token("Once upon"),
        ])]));
        sup.submit("tell a story").await.expect("submit");
        wait_for_answer(&sup, "Once upon").await;

        sup.cancel_active().await.expect("outcome");
        let history = sup.history();
        assert_eq!(history.len(), 2);
        let reply = &history[1];
        assert_eq!(reply.content, "Once upon");
        assert_eq!(reply.reasoning_text.as_deref(), Some("pondering"));
        assert_eq!(reply.termination, Termination::Cancelled);
        assert!(reply.stats.is_none());
        assert!(sup.last_stats().is_none());
        assert!(sup.cancel_active().await.is_none());
    }

    #[tokio::test]
    async fn lone_error_appends_nothing() {
        let mut sup = supervisor(FakeEndpoint::new(vec![Script::Events(vec![Ok(
            StreamEvent::error("upstream failure"),
        )])]));
        sup.submit("hi").await.expect("submit");
        let outcome = sup.wait_active().await.expect("outcome");
        assert!(outcome.message.is_none());
        assert_eq!(sup.history().len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_after_text_commits_partial_reply() {
        let mut sup = supervisor(FakeEndpoint::new(vec![Script::Frames(vec![
            "event: token\ndata: {\"content\": \"Dinner is at \", \"tokens_per_second\": 4.0}\n\n",
            "event: mystery\ndata: {}\n\n",
            "event: token\ndata: {\"content\": \"never shown\"}\n\n",
        ])]));
        sup.submit("when is dinner?").await.expect("submit");
        wait_idle(&sup).await;

        let history = sup.history();
        assert_eq!(history.len(), 2);
        let reply = &history[1];
        assert_eq!(reply.content, "Dinner is at ");
        assert!(matches!(
            &reply.termination,
            Termination::Failed {
                failure: TurnFailure::Upstream { message }
            } if message.contains("mystery")
        ));
        assert!(reply.stats.is_none());
    }

    #[tokio::test]
    async fn connection_refused_is_an_immediate_failure() {
        let mut sup = supervisor(FakeEndpoint::new(vec![]));
        sup.submit("hi").await.expect("submit");
        let outcome = sup.wait_active().await.expect("outcome");
        assert!(matches!(
            outcome.termination,
            Termination::Failed {
                failure: TurnFailure::Transport { .. }
            }
        ));
        assert_eq!(sup.history().len(), 1);
    }

    #[tokio::test]
    async fn partial_state_retains_rate_for_unrated_token() {
        let mut sup = supervisor(FakeEndpoint::new(vec![Script::EventsThenPending(vec![
            StreamEvent::token_with_rate("A", 10.0),
            StreamEvent::token("B"),
        ])]));
        sup.submit("letters").await.expect("submit");
        wait_for_answer(&sup, "AB").await;

        let partial = sup.current_partial_state().expect("partial");
        assert_eq!(partial.current_rate, Some(10.0));
        assert_eq!(partial.state, SessionState::Streaming);
        assert!(partial.is_active);
        sup.cancel_active().await;
    }

    #[tokio::test]
    async fn late_tokens_never_leak_into_the_next_turn() {
        let mut sup = supervisor(FakeEndpoint::new(vec![
            Script::Events(vec![
                Ok(StreamEvent::token("one")),
                Ok(StreamEvent::done(1, 10, 100.0)),
                Ok(StreamEvent::token("leak")),
            ]),
            Script::EventsThenPending(vec![StreamEvent::token("two")]),
        ]));
        sup.submit("first").await.expect("submit");
        sup.wait_active().await.expect("first outcome");

        sup.submit("second").await.expect("submit");
        wait_for_answer(&sup, "two").await;
        let partial = sup.current_partial_state().expect("partial");
        assert_eq!(partial.answer_text, "two");

        sup.cancel_active().await.expect("second outcome");
        assert_eq!(
            contents(&sup),
            vec![
                (Role::User, "first".to_string()),
                (Role::Assistant, "one".to_string()),
                (Role::User, "second".to_string()),
                (Role::Assistant, "two".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn finished_turn_does_not_block_submit() {
        let mut sup = supervisor(FakeEndpoint::new(vec![
            Script::Events(vec![
                Ok(StreamEvent::token("done already")),
                Ok(StreamEvent::done(3, 30, 100.0)),
            ]),
            Script::EventsThenPending(vec![]),
        ]));
        sup.submit("first").await.expect("submit");
        wait_idle(&sup).await;

        sup.submit("second").await.expect("second submit");
        let history = sup.history();
        assert_eq!(history[1].content, "done already");
        assert_eq!(history[2].content, "second");
        sup.cancel_active().await;
    }

    #[tokio::test]
    async fn discard_policy_commits_nothing_on_failure() {
        let endpoint = FakeEndpoint::new(vec![Script::Events(vec![
            Ok(StreamEvent::token("partial")),
            Err(TransportError::read("reset")),
        ])]);
        let mut sup = Supervisor::new(
            endpoint,
            SupervisorConfig::default().partial_content(PartialContentPolicy::Discard),
        );
        sup.submit("hi").await.expect("submit");
        sup.wait_active().await.expect("outcome");
        assert_eq!(sup.history().len(), 1);
    }

    #[tokio::test]
    async fn history_sink_sees_every_appended_message() {
        let sink = MemoryHistory::new();
        let endpoint = FakeEndpoint::new(vec![Script::Events(vec![
            Ok(StreamEvent::token("ok")),
            Ok(StreamEvent::done(1, 1, 1000.0)),
        ])]);
        let mut sup = supervisor(endpoint).with_history_sink(Arc::new(sink.clone()));
        sup.submit("ping").await.expect("submit");
        sup.wait_active().await.expect("outcome");
        assert_eq!(sink.messages(), sup.history());
    }

    #[tokio::test]
    async fn request_carries_conversation_id() {
        let endpoint = FakeEndpoint::new(vec![Script::Events(vec![Ok(StreamEvent::done(
            0, 0, 0.0,
        ))])]);
        let mut sup = Supervisor::new(
            endpoint.clone(),
            SupervisorConfig::default().conversation_id("kitchen"),
        );
        let turn_id = sup.submit("hi").await.expect("submit");
        sup.wait_active().await.expect("outcome");

        let requests = endpoint.requests.lock().expect("lock");
        assert_eq!(requests[0].turn_id, turn_id);
        assert_eq!(requests[0].message, "hi");
        assert_eq!(requests[0].conversation_id.as_deref(), Some("kitchen"));
        assert_eq!(sup.history()[1].content, "");
    }

    #[tokio::test]
    async fn abort_handle_cancels_from_outside() {
        let mut sup = supervisor(FakeEndpoint::new(vec![Script::EventsThenPending(vec![
            StreamEvent::token("partial"),
        ])]));
        sup.submit("hi").await.expect("submit");
        wait_for_answer(&sup, "partial").await;

        let handle = sup.abort_handle().expect("handle");
        handle.abort();
        wait_idle(&sup).await;
        assert_eq!(sup.history().len(), 2);

        let outcome = sup.wait_active().await.expect("outcome");
        assert_eq!(outcome.turn_id, handle.turn_id());
        assert_eq!(outcome.termination, Termination::Cancelled);
    }
}
