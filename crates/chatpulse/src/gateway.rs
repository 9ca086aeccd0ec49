//! Request/response access to the backend's REST endpoints.

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::GatewayError;
use crate::protocol::parse_wire_timestamp;
use crate::types::SessionIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub active_connections: u64,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// Session record as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: String,
    #[serde(default)]
    pub total_messages: u64,
    #[serde(default)]
    pub total_words: u64,
    #[serde(default)]
    pub questions_count: u64,
}

impl SessionInfo {
    /// Only the id matters to the client; an unreadable `created_at` falls
    /// back to the local clock.
    pub fn identity(&self) -> SessionIdentity {
        let created_at = parse_wire_timestamp(&self.created_at).unwrap_or_else(|| {
            debug!(created_at = %self.created_at, "Unparsable created_at; using local time");
            Utc::now()
        });
        SessionIdentity {
            id: self.id.clone(),
            created_at,
        }
    }
}

/// One persisted message with its analytics, as the backend reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub session_id: String,
    pub content: String,
    pub word_count: u64,
    pub char_count: u64,
    pub sentence_count: u64,
    pub is_question: bool,
    pub sentiment: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHistory {
    #[serde(default)]
    pub messages: Vec<HistoryRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SentimentCounts {
    #[serde(default)]
    pub positive: u64,
    #[serde(default)]
    pub negative: u64,
    #[serde(default)]
    pub neutral: u64,
}

/// Server-side aggregate for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatsReport {
    pub session_id: String,
    pub total_messages: u64,
    pub total_words: u64,
    pub questions_asked: u64,
    #[serde(default)]
    pub avg_message_length: f64,
    #[serde(default)]
    pub sentiment_breakdown: SentimentCounts,
}

/// Backend operations the orchestrator depends on.
#[async_trait]
pub trait BackendApi: Send + Sync {
    async fn health(&self) -> Result<HealthStatus, GatewayError>;

    async fn create_session(&self) -> Result<SessionInfo, GatewayError>;

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, GatewayError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), GatewayError>;

    async fn message_history(&self, session_id: &str) -> Result<MessageHistory, GatewayError>;

    async fn session_stats(&self, session_id: &str) -> Result<SessionStatsReport, GatewayError>;
}

/// HTTP implementation of [`BackendApi`].
#[derive(Debug, Clone)]
pub struct RequestGateway {
    base_url: String,
    http: reqwest::Client,
}

impl RequestGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, http }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| GatewayError::Request(e.to_string()))?;
        Ok(Self::with_client(config.api_url.clone(), http))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let message = body
            .get("message")
            .or_else(|| body.get("detail"))
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

        Err(GatewayError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BackendApi for RequestGateway {
    async fn health(&self) -> Result<HealthStatus, GatewayError> {
        debug!(base_url = %self.base_url, "Probing backend health");
        self.fetch(self.http.get(self.url("/health"))).await
    }

    async fn create_session(&self) -> Result<SessionInfo, GatewayError> {
        self.fetch(
            self.http
                .post(self.url("/sessions"))
                .header(reqwest::header::CONTENT_TYPE, "application/json"),
        )
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, GatewayError> {
        self.fetch(self.http.get(self.url(&format!("/sessions/{session_id}"))))
            .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), GatewayError> {
        self.execute(self.http.delete(self.url(&format!("/sessions/{session_id}"))))
            .await?;
        Ok(())
    }

    async fn message_history(&self, session_id: &str) -> Result<MessageHistory, GatewayError> {
        self.fetch(
            self.http
                .get(self.url(&format!("/sessions/{session_id}/messages"))),
        )
        .await
    }

    async fn session_stats(&self, session_id: &str) -> Result<SessionStatsReport, GatewayError> {
        self.fetch(self.http.get(self.url(&format!("/sessions/{session_id}/stats"))))
            .await
    }
}
