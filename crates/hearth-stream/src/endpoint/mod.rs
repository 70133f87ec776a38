//! Generation endpoint contract and the HTTP implementation.
//!
//! The supervisor only sees `GenerationEndpoint`; how units travel and get
//! decoded is the endpoint's business.
mod config;
mod http;

pub use config::EndpointConfig;
pub use http::HttpEndpoint;

use std::pin::Pin;

use crate::errors::TransportError;
use crate::event::StreamEvent;

/// Ordered, lazily consumed events for one turn.
///
/// An `Err` item is a transport failure and ends the turn.
pub type EventSource =
    Pin<Box<dyn futures::Stream<Item = Result<StreamEvent, TransportError>> + Send + 'static>>;

/// Request sent to the generation endpoint for one turn.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct GenerationRequest {
    #[serde(skip)]
    pub turn_id: uuid::Uuid,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// Backend that produces a streamed reply for a user message.
#[async_trait::async_trait]
pub trait GenerationEndpoint: Send + Sync {
    /// Opens the event stream for one turn.
    ///
    /// Failures before any event is available are returned here.
    async fn open(&self, request: GenerationRequest) -> Result<EventSource, TransportError>;
}
