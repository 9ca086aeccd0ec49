use thiserror::Error;

/// Failures of the physical realtime link. Never fatal: they feed the
/// reconnect policy and surface only through `ConnectionStatus::last_error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Connection timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection reset: {0}")]
    Reset(String),
}

/// An inbound frame that could not be turned into an event.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unknown event kind: {0}")]
    UnknownEventKind(String),

    #[error("Invalid sentiment value: {0}")]
    InvalidSentiment(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message is empty")]
    EmptyMessage,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Not connected")]
    NotConnected,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to encode message: {0}")]
    Encode(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from the request/response collaborator endpoints.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("No active session")]
    NoSession,
}

/// Startup failures. Distinct from ordinary connection loss: the backend
/// itself is unreachable or refusing sessions.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Health probe failed: {0}")]
    HealthProbeFailed(#[source] GatewayError),

    #[error("Backend reported status '{0}'")]
    Unhealthy(String),

    #[error("Session creation failed: {0}")]
    SessionCreationFailed(#[source] GatewayError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}
