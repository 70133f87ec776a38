//! Live response streaming for the Hearth family assistant.
//!
//! A `Supervisor` submits a user message to a `GenerationEndpoint`, folds the
//! returned event stream into a live `TurnSnapshot` the UI can render while
//! tokens arrive, and commits exactly one `FinalizedMessage` per turn to the
//! conversation history (or none, when nothing was produced).
//!
//! # Streaming a reply
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hearth_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), SupervisorError> {
//! let endpoint = Arc::new(HttpEndpoint::from_env()?);
//! let mut supervisor = Supervisor::new(endpoint, SupervisorConfig::default());
//!
//! supervisor.submit("What's on the calendar today?").await?;
//! let mut updates = supervisor.subscribe();
//! // The turn may already be committed; `None` means idle.
//! updates.mark_changed();
//! while updates.changed().await.is_ok() {
//!     match updates.borrow_and_update().as_ref() {
//!         Some(snapshot) => print!("\r{}", snapshot.answer_text),
//!         None => break,
//!     }
//! }
//! supervisor.wait_active().await;
//! println!("\n{:?}", supervisor.last_stats());
//! # Ok(())
//! # }
//! ```

/// Per-turn accumulation of answer text, reasoning text, and rate.
pub mod accumulator;
/// Supervisor behaviour options.
pub mod config;
/// Server-sent-event framing and event decoding.
pub mod decoder;
/// Generation endpoint contract and the HTTP implementation.
pub mod endpoint;
/// Public error types.
pub mod errors;
/// Typed stream events and finalization statistics.
pub mod event;
/// History sinks for finalized messages.
pub mod history;
/// Finalized conversation messages.
pub mod message;
/// Process-wide logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Per-turn lifecycle state machine.
pub mod session;
/// Single-active-turn supervisor.
pub mod supervisor;
/// Token count and throughput estimation.
pub mod throughput;

pub use accumulator::Accumulator;
pub use config::{PartialContentPolicy, SupervisorConfig};
pub use decoder::{SseDecoder, SseFrame, decode_byte_stream, decode_frame};
pub use endpoint::{EndpointConfig, EventSource, GenerationEndpoint, GenerationRequest, HttpEndpoint};
pub use errors::{
    DecodeError, HistoryError, ProtocolViolation, SupervisorError, TransportError, TurnFailure,
};
pub use event::{FinalizationStats, StreamEvent};
pub use history::{HistorySink, MemoryHistory};
pub use message::{FinalizedMessage, Role, Termination};
pub use observability::init_observability;
pub use session::{SessionState, Step, StreamSession, TurnOutcome, TurnSnapshot};
pub use supervisor::{AbortHandle, Supervisor};
pub use throughput::{ThroughputEstimator, estimate_tokens};
