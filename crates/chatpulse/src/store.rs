//! Session state: the message log and the latest server statistics.
//!
//! Every mutation produces a new immutable [`SessionSnapshot`]; readers keep
//! whatever snapshot they were handed and never observe partial updates.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::protocol::InboundEvent;
use crate::types::{ChatMessage, MessageOrigin, SessionStatistics};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    /// Bumped once per applied mutation.
    pub revision: u64,
    pub messages: Vec<Arc<ChatMessage>>,
    pub statistics: SessionStatistics,
    /// A user message went out and no response has arrived since.
    pub awaiting_reply: bool,
}

impl SessionSnapshot {
    pub fn last_user_message(&self) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.origin == MessageOrigin::User)
            .map(|m| m.as_ref())
    }

    pub fn last_message(&self) -> Option<&ChatMessage> {
        self.messages.last().map(|m| m.as_ref())
    }
}

pub struct SessionStateStore {
    current: Arc<SessionSnapshot>,
    publisher: watch::Sender<Arc<SessionSnapshot>>,
}

impl Default for SessionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStateStore {
    pub fn new() -> Self {
        let current = Arc::new(SessionSnapshot::default());
        let (publisher, _) = watch::channel(current.clone());
        Self { current, publisher }
    }

    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.current.clone()
    }

    /// Receiver that always holds the latest snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<SessionSnapshot>> {
        self.publisher.subscribe()
    }

    /// Record a message the user has just sent. Statistics are untouched;
    /// only the server may change them.
    pub fn apply_user_send(&mut self, text: &str) -> Arc<SessionSnapshot> {
        let mut next = (*self.current).clone();
        next.messages.push(Arc::new(ChatMessage {
            id: Uuid::new_v4().to_string(),
            origin: MessageOrigin::User,
            content: text.to_string(),
            analytics: None,
            created_at: Utc::now(),
        }));
        next.awaiting_reply = true;
        self.commit(next)
    }

    /// Apply a decoded server event. Statistics, when present, replace the
    /// previous value wholesale.
    pub fn apply_server_event(&mut self, event: &InboundEvent) -> Arc<SessionSnapshot> {
        let mut next = (*self.current).clone();

        match event {
            InboundEvent::MessageResponse(response) => {
                if response.echo.is_some() || response.analytics.is_some() {
                    next.messages.push(Arc::new(ChatMessage {
                        id: Uuid::new_v4().to_string(),
                        origin: MessageOrigin::System,
                        content: response.echo.clone().unwrap_or_default(),
                        analytics: response.analytics.clone(),
                        created_at: response.received_at,
                    }));
                }
                if let Some(stats) = &response.session_stats {
                    next.statistics = stats.clone();
                }
                next.awaiting_reply = false;
            }
        }

        self.commit(next)
    }

    fn commit(&mut self, mut next: SessionSnapshot) -> Arc<SessionSnapshot> {
        next.revision = self.current.revision + 1;
        let next = Arc::new(next);
        self.current = next.clone();
        self.publisher.send_replace(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageResponse;
    use crate::types::{MessageAnalytics, Sentiment, SentimentBreakdown};

    fn response(
        echo: Option<&str>,
        with_analytics: bool,
        stats: Option<SessionStatistics>,
    ) -> InboundEvent {
        let now = Utc::now();
        InboundEvent::MessageResponse(MessageResponse {
            echo: echo.map(str::to_string),
            analytics: with_analytics.then(|| MessageAnalytics {
                word_count: 3,
                char_count: 16,
                sentence_count: 1,
                is_question: true,
                sentiment: Sentiment::Neutral,
                processed_at: now,
            }),
            session_stats: stats,
            server_timestamp: None,
            received_at: now,
        })
    }

    fn stats(total_messages: u64, total_words: u64) -> SessionStatistics {
        SessionStatistics {
            total_messages,
            total_words,
            questions_asked: 0,
            avg_message_length: total_words as f64 / total_messages.max(1) as f64,
            sentiment_breakdown: SentimentBreakdown {
                positive: total_messages,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_initial_snapshot_is_empty() {
        let store = SessionStateStore::new();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.revision, 0);
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.statistics, SessionStatistics::default());
        assert!(!snapshot.awaiting_reply);
    }

    #[test]
    fn test_user_send_appends_without_touching_stats() {
        let mut store = SessionStateStore::new();
        let snapshot = store.apply_user_send("hello there");

        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.messages.len(), 1);
        let message = snapshot.last_user_message().unwrap();
        assert_eq!(message.content, "hello there");
        assert_eq!(message.origin, MessageOrigin::User);
        assert!(message.analytics.is_none());
        assert_eq!(snapshot.statistics, SessionStatistics::default());
        assert!(snapshot.awaiting_reply);
    }

    #[test]
    fn test_server_event_appends_system_message() {
        let mut store = SessionStateStore::new();
        store.apply_user_send("Is this working?");
        let snapshot = store.apply_server_event(&response(
            Some("Is this working?"),
            true,
            Some(stats(1, 3)),
        ));

        assert_eq!(snapshot.messages.len(), 2);
        let reply = snapshot.last_message().unwrap();
        assert_eq!(reply.origin, MessageOrigin::System);
        assert_eq!(reply.content, "Is this working?");
        assert!(reply.analytics.as_ref().unwrap().is_question);
        assert_eq!(snapshot.statistics.total_words, 3);
        assert!(!snapshot.awaiting_reply);
    }

    #[test]
    fn test_stats_only_event_adds_no_message() {
        let mut store = SessionStateStore::new();
        let snapshot = store.apply_server_event(&response(None, false, Some(stats(4, 10))));
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.statistics.total_messages, 4);
    }

    #[test]
    fn test_analytics_without_echo_uses_empty_content() {
        let mut store = SessionStateStore::new();
        let snapshot = store.apply_server_event(&response(None, true, None));
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].content, "");
    }

    #[test]
    fn test_stats_are_replaced_not_merged() {
        let mut store = SessionStateStore::new();
        store.apply_server_event(&response(Some("a"), true, Some(stats(5, 50))));
        let snapshot = store.apply_server_event(&response(Some("b"), true, Some(stats(1, 2))));
        assert_eq!(snapshot.statistics, stats(1, 2));

        // Absent stats leave the previous value alone.
        let snapshot = store.apply_server_event(&response(Some("c"), true, None));
        assert_eq!(snapshot.statistics, stats(1, 2));
    }

    #[test]
    fn test_earlier_snapshots_are_unchanged() {
        let mut store = SessionStateStore::new();
        let first = store.apply_user_send("one");
        let second = store.apply_server_event(&response(Some("one"), true, Some(stats(1, 1))));

        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.statistics, SessionStatistics::default());
        assert_eq!(second.messages.len(), 2);
        assert!(Arc::ptr_eq(&first.messages[0], &second.messages[0]));
        assert_eq!(second.revision, first.revision + 1);
    }

    #[test]
    fn test_messages_keep_application_order() {
        let mut store = SessionStateStore::new();
        store.apply_user_send("first");
        store.apply_server_event(&response(Some("E1"), false, None));
        store.apply_server_event(&response(Some("E2"), false, None));

        let contents: Vec<_> = store
            .snapshot()
            .messages
            .iter()
            .map(|m| m.content.clone())
            .collect();
        assert_eq!(contents, vec!["first", "E1", "E2"]);
    }

    #[test]
    fn test_subscribers_see_latest_snapshot() {
        let mut store = SessionStateStore::new();
        let mut rx = store.subscribe();
        store.apply_user_send("hi");
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().revision, 1);
    }
}
