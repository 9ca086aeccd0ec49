//! Client for a realtime chat analytics backend.
//!
//! Keeps one WebSocket connection alive with fixed-delay reconnects, decodes
//! the backend's analytics events, and maintains an immutable session
//! snapshot (message log plus server-reported statistics).

pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod orchestrator;
pub mod protocol;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use error::{
    BootstrapError, ConfigError, DecodeError, GatewayError, SendError, TransportError,
    ValidationError,
};
pub use gateway::{
    BackendApi, HealthStatus, HistoryRecord, MessageHistory, RequestGateway, SessionInfo,
    SessionStatsReport,
};
pub use orchestrator::{BootstrapState, SessionOrchestrator};
pub use protocol::{decode_inbound, encode_outbound, InboundEvent, MessageResponse, OutboundEnvelope};
pub use store::{SessionSnapshot, SessionStateStore};
pub use types::{
    ChatMessage, MessageAnalytics, MessageOrigin, Sentiment, SentimentBreakdown,
    SessionIdentity, SessionStatistics,
};
