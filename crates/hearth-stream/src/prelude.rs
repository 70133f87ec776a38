//! Common imports for driving a conversation.
pub use crate::{
    AbortHandle, EndpointConfig, FinalizationStats, FinalizedMessage, GenerationEndpoint,
    HistorySink, HttpEndpoint, PartialContentPolicy, Role, SessionState, StreamEvent, Supervisor,
    SupervisorConfig, SupervisorError, Termination, TurnOutcome, TurnSnapshot,
};
