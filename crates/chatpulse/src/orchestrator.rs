use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{BootstrapError, GatewayError, SendError, ValidationError};
use crate::gateway::{
    BackendApi, HealthStatus, MessageHistory, RequestGateway, SessionInfo, SessionStatsReport,
};
use crate::protocol::{encode_outbound, InboundEvent};
use crate::store::{SessionSnapshot, SessionStateStore};
use crate::types::SessionIdentity;

/// Outcome of the startup sequence, kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    NotStarted,
    /// The health probe failed; no connection was attempted.
    Unavailable { reason: String },
    /// The probe passed but the client has not been started yet.
    Healthy,
    /// Connected without a server-side session.
    Degraded { reason: String },
    Ready,
}

/// Ties together the backend gateway, the realtime connection and the
/// session store for one chat session.
///
/// Inbound events are applied only when the caller pumps them through
/// [`next_update`](Self::next_update) or [`drain_pending`](Self::drain_pending).
pub struct SessionOrchestrator<A: BackendApi = RequestGateway> {
    api: A,
    connection: ConnectionManager,
    store: SessionStateStore,
    events: mpsc::UnboundedReceiver<InboundEvent>,
    session: Option<SessionIdentity>,
    bootstrap: BootstrapState,
}

impl SessionOrchestrator<RequestGateway> {
    pub fn from_config(config: &ClientConfig) -> Result<Self, GatewayError> {
        let api = RequestGateway::from_config(config)?;
        Ok(Self::new(api, ConnectionManager::from_config(config)))
    }
}

impl<A: BackendApi> SessionOrchestrator<A> {
    pub fn new(api: A, connection: ConnectionManager) -> Self {
        let events = connection.subscribe_events();
        Self {
            api,
            connection,
            store: SessionStateStore::new(),
            events,
            session: None,
            bootstrap: BootstrapState::NotStarted,
        }
    }

    /// Probe health, obtain a session and open the realtime connection.
    ///
    /// A failed or unhealthy probe returns an error and leaves the
    /// connection untouched. A failed session creation does not stop the
    /// connection; it shows up as [`BootstrapState::Degraded`].
    pub async fn start(&mut self) -> Result<(), BootstrapError> {
        self.probe_health().await?;

        if self.session.is_none() {
            match self.create_session().await {
                Ok(identity) => {
                    info!(session_id = %identity.id, "Session created");
                    self.session = Some(identity);
                    self.bootstrap = BootstrapState::Ready;
                }
                Err(e) => {
                    warn!(error = %e, "Continuing without a session id");
                    self.bootstrap = BootstrapState::Degraded {
                        reason: e.to_string(),
                    };
                }
            }
        } else {
            self.bootstrap = BootstrapState::Ready;
        }

        self.connection.connect();
        Ok(())
    }

    /// Re-run only the health probe. Never opens the connection, and a
    /// failure does not demote a session whose link is open.
    pub async fn retry_health_probe(&mut self) -> Result<HealthStatus, BootstrapError> {
        let health = self.probe_health().await?;
        if matches!(self.bootstrap, BootstrapState::Unavailable { .. }) {
            self.bootstrap = BootstrapState::Healthy;
        }
        Ok(health)
    }

    async fn probe_health(&mut self) -> Result<HealthStatus, BootstrapError> {
        let result = match self.api.health().await {
            Ok(health) if health.is_healthy() => Ok(health),
            Ok(health) => Err(BootstrapError::Unhealthy(health.status)),
            Err(e) => Err(BootstrapError::HealthProbeFailed(e)),
        };

        match &result {
            Ok(health) => info!(
                active_connections = health.active_connections,
                "Backend healthy"
            ),
            // A live link outranks a failed probe.
            Err(e) if self.connection.state() == ConnectionState::Open => {
                warn!(error = %e, "Health probe failed while connected");
            }
            Err(e) => {
                warn!(error = %e, "Backend unavailable");
                self.bootstrap = BootstrapState::Unavailable {
                    reason: e.to_string(),
                };
            }
        }
        result
    }

    async fn create_session(&self) -> Result<SessionIdentity, BootstrapError> {
        self.api
            .create_session()
            .await
            .map(|info| info.identity())
            .map_err(BootstrapError::SessionCreationFailed)
    }

    /// Validate, transmit and record a user message.
    ///
    /// The message is appended to the log only after the transport accepted
    /// it. Nothing is queued while disconnected.
    pub async fn send_user_message(
        &mut self,
        text: &str,
    ) -> Result<Arc<SessionSnapshot>, SendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        if self.connection.state() != ConnectionState::Open {
            return Err(SendError::NotConnected);
        }

        self.connection
            .send(encode_outbound(text, Utc::now()))
            .await?;
        Ok(self.store.apply_user_send(text))
    }

    /// Wait for the next inbound event and apply it. Returns `None` once the
    /// connection actor has stopped.
    pub async fn next_update(&mut self) -> Option<Arc<SessionSnapshot>> {
        let event = self.events.recv().await?;
        Some(self.store.apply_server_event(&event))
    }

    /// Apply every event that has already arrived, without waiting.
    pub fn drain_pending(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.events.try_recv() {
            self.store.apply_server_event(&event);
            applied += 1;
        }
        applied
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.store.snapshot()
    }

    pub fn watch_snapshots(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.store.subscribe()
    }

    pub fn session(&self) -> Option<&SessionIdentity> {
        self.session.as_ref()
    }

    pub fn bootstrap_state(&self) -> &BootstrapState {
        &self.bootstrap
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    fn session_id(&self) -> Result<&str, GatewayError> {
        self.session
            .as_ref()
            .map(|s| s.id.as_str())
            .ok_or(GatewayError::NoSession)
    }

    /// Persisted history of the current session.
    pub async fn message_history(&self) -> Result<MessageHistory, GatewayError> {
        self.api.message_history(self.session_id()?).await
    }

    /// Server-side record of the current session.
    pub async fn refresh_session(&self) -> Result<SessionInfo, GatewayError> {
        self.api.get_session(self.session_id()?).await
    }

    pub async fn session_stats(&self) -> Result<SessionStatsReport, GatewayError> {
        self.api.session_stats(self.session_id()?).await
    }

    /// Delete the session on the backend and forget its identity.
    pub async fn end_session(&mut self) -> Result<(), GatewayError> {
        let id = self.session_id()?.to_string();
        self.api.delete_session(&id).await?;
        info!(session_id = %id, "Session ended");
        self.session = None;
        Ok(())
    }

    pub async fn shutdown(&mut self) {
        self.connection.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectPolicy;
    use crate::testing::{message_response_frame, wait_for_state, MockBackend};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn connection_for(backend: &MockBackend) -> ConnectionManager {
        ConnectionManager::new(
            backend.ws_url(),
            ReconnectPolicy::fixed(Duration::from_millis(50)),
        )
    }

    /// Health probe that always fails, counting calls.
    struct DownApi {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl BackendApi for DownApi {
        async fn health(&self) -> Result<HealthStatus, GatewayError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Err(GatewayError::Request("connection refused".to_string()))
        }

        async fn create_session(&self) -> Result<SessionInfo, GatewayError> {
            panic!("session creation must not be attempted");
        }

        async fn get_session(&self, _: &str) -> Result<SessionInfo, GatewayError> {
            unreachable!()
        }

        async fn delete_session(&self, _: &str) -> Result<(), GatewayError> {
            unreachable!()
        }

        async fn message_history(&self, _: &str) -> Result<MessageHistory, GatewayError> {
            unreachable!()
        }

        async fn session_stats(&self, _: &str) -> Result<SessionStatsReport, GatewayError> {
            unreachable!()
        }
    }

    /// Healthy backend whose session record carries a fixed `created_at`.
    struct FixedSessionApi {
        created_at: &'static str,
    }

    #[async_trait]
    impl BackendApi for FixedSessionApi {
        async fn health(&self) -> Result<HealthStatus, GatewayError> {
            Ok(HealthStatus {
                status: "healthy".to_string(),
                active_connections: 0,
                timestamp: None,
            })
        }

        async fn create_session(&self) -> Result<SessionInfo, GatewayError> {
            Ok(SessionInfo {
                id: "sess-42".to_string(),
                created_at: self.created_at.to_string(),
                total_messages: 0,
                total_words: 0,
                questions_count: 0,
            })
        }

        async fn get_session(&self, _: &str) -> Result<SessionInfo, GatewayError> {
            unreachable!()
        }

        async fn delete_session(&self, _: &str) -> Result<(), GatewayError> {
            unreachable!()
        }

        async fn message_history(&self, _: &str) -> Result<MessageHistory, GatewayError> {
            unreachable!()
        }

        async fn session_stats(&self, _: &str) -> Result<SessionStatsReport, GatewayError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn test_session_kept_with_space_separated_created_at() {
        let backend = MockBackend::start().await;
        let api = FixedSessionApi {
            created_at: "2024-05-01 12:30:00",
        };
        let mut orchestrator = SessionOrchestrator::new(api, connection_for(&backend));

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.bootstrap_state(), &BootstrapState::Ready);
        let session = orchestrator.session().unwrap();
        assert_eq!(session.id, "sess-42");
        assert_eq!(session.created_at.to_rfc3339(), "2024-05-01T12:30:00+00:00");
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_kept_with_unreadable_created_at() {
        let backend = MockBackend::start().await;
        let api = FixedSessionApi {
            created_at: "last tuesday",
        };
        let mut orchestrator = SessionOrchestrator::new(api, connection_for(&backend));

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.bootstrap_state(), &BootstrapState::Ready);
        assert_eq!(orchestrator.session().unwrap().id, "sess-42");
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_probe_while_open_keeps_ready() {
        let backend = MockBackend::start().await;
        let mut orchestrator =
            SessionOrchestrator::new(RequestGateway::new(backend.api_url()), connection_for(&backend));
        let mut status = orchestrator.connection().subscribe_status();
        orchestrator.start().await.unwrap();
        wait_for_state(&mut status, ConnectionState::Open, WAIT).await;

        backend.set_health("unhealthy");
        assert!(matches!(
            orchestrator.retry_health_probe().await,
            Err(BootstrapError::Unhealthy(_))
        ));
        assert_eq!(orchestrator.bootstrap_state(), &BootstrapState::Ready);
        assert!(orchestrator.session().is_some());

        // Once the link is down, a failed probe does demote.
        orchestrator.shutdown().await;
        assert!(orchestrator.retry_health_probe().await.is_err());
        assert!(matches!(
            orchestrator.bootstrap_state(),
            BootstrapState::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_start_ready() {
        let backend = MockBackend::start().await;
        let mut orchestrator =
            SessionOrchestrator::new(RequestGateway::new(backend.api_url()), connection_for(&backend));
        let mut status = orchestrator.connection().subscribe_status();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.bootstrap_state(), &BootstrapState::Ready);
        let session = orchestrator.session().unwrap();
        assert_eq!(backend.session_ids(), vec![session.id.clone()]);

        wait_for_state(&mut status, ConnectionState::Open, WAIT).await;
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_probe_failure_never_connects() {
        let backend = MockBackend::start().await;
        let api = DownApi {
            probes: AtomicUsize::new(0),
        };
        let mut orchestrator = SessionOrchestrator::new(api, connection_for(&backend));

        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, BootstrapError::HealthProbeFailed(_)));
        assert!(matches!(
            orchestrator.bootstrap_state(),
            BootstrapState::Unavailable { .. }
        ));

        assert!(orchestrator.retry_health_probe().await.is_err());
        assert_eq!(orchestrator.api.probes.load(Ordering::SeqCst), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orchestrator.connection_state(), ConnectionState::Idle);
        assert_eq!(backend.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_retry_probe_recovers_without_connecting() {
        let backend = MockBackend::start().await;
        backend.set_health("unhealthy");
        let mut orchestrator =
            SessionOrchestrator::new(RequestGateway::new(backend.api_url()), connection_for(&backend));

        let err = orchestrator.start().await.unwrap_err();
        assert!(matches!(err, BootstrapError::Unhealthy(ref s) if s == "unhealthy"));

        backend.set_health("healthy");
        let health = orchestrator.retry_health_probe().await.unwrap();
        assert!(health.is_healthy());
        assert_eq!(orchestrator.bootstrap_state(), &BootstrapState::Healthy);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orchestrator.connection_state(), ConnectionState::Idle);
        assert_eq!(backend.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_session_creation_failure_still_connects() {
        let backend = MockBackend::start().await;
        backend.fail_session_creation(true);
        let mut orchestrator =
            SessionOrchestrator::new(RequestGateway::new(backend.api_url()), connection_for(&backend));
        let mut status = orchestrator.connection().subscribe_status();

        orchestrator.start().await.unwrap();
        assert!(orchestrator.session().is_none());
        match orchestrator.bootstrap_state() {
            BootstrapState::Degraded { reason } => assert!(reason.contains("database unavailable")),
            other => panic!("unexpected state: {other:?}"),
        }

        wait_for_state(&mut status, ConnectionState::Open, WAIT).await;
        assert!(matches!(
            orchestrator.message_history().await,
            Err(GatewayError::NoSession)
        ));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_validation_and_not_connected() {
        let backend = MockBackend::start().await;
        let mut orchestrator =
            SessionOrchestrator::new(RequestGateway::new(backend.api_url()), connection_for(&backend));

        assert_eq!(
            orchestrator.send_user_message("   \n\t").await.unwrap_err(),
            SendError::Validation(ValidationError::EmptyMessage)
        );
        assert_eq!(
            orchestrator.send_user_message("hello").await.unwrap_err(),
            SendError::NotConnected
        );
        assert!(orchestrator.snapshot().messages.is_empty());
        assert_eq!(orchestrator.snapshot().revision, 0);
    }

    #[tokio::test]
    async fn test_send_trims_and_applies_reply() {
        let backend = MockBackend::start().await;
        let mut orchestrator =
            SessionOrchestrator::new(RequestGateway::new(backend.api_url()), connection_for(&backend));
        let mut status = orchestrator.connection().subscribe_status();
        orchestrator.start().await.unwrap();
        wait_for_state(&mut status, ConnectionState::Open, WAIT).await;

        backend.queue_reply(message_response_frame(
            "hi there",
            serde_json::json!({"total_messages": 1, "total_words": 2, "questions_asked": 0}),
        ));
        let snapshot = orchestrator.send_user_message("  hi there  ").await.unwrap();
        assert_eq!(snapshot.last_user_message().unwrap().content, "hi there");
        assert!(snapshot.awaiting_reply);

        let frames = backend.wait_for_received(1, WAIT).await;
        assert!(frames[0].contains("\"content\":\"hi there\""));

        let snapshot = tokio::time::timeout(WAIT, orchestrator.next_update())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.statistics.total_words, 2);
        assert!(!snapshot.awaiting_reply);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_end_session_forgets_identity() {
        let backend = MockBackend::start().await;
        let mut orchestrator =
            SessionOrchestrator::new(RequestGateway::new(backend.api_url()), connection_for(&backend));
        orchestrator.start().await.unwrap();

        let info = orchestrator.refresh_session().await.unwrap();
        assert_eq!(Some(info.id.as_str()), orchestrator.session().map(|s| s.id.as_str()));

        orchestrator.end_session().await.unwrap();
        assert!(orchestrator.session().is_none());
        assert!(backend.session_ids().is_empty());
        assert!(matches!(
            orchestrator.end_session().await,
            Err(GatewayError::NoSession)
        ));
        orchestrator.shutdown().await;
    }
}
