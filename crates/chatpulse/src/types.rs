use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a message in the session log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    User,
    System,
}

impl std::fmt::Display for MessageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageOrigin::User => write!(f, "user"),
            MessageOrigin::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl Sentiment {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sentiment::Positive => write!(f, "positive"),
            Sentiment::Negative => write!(f, "negative"),
            Sentiment::Neutral => write!(f, "neutral"),
        }
    }
}

/// Analytics computed by the backend for one echoed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageAnalytics {
    pub word_count: u64,
    pub char_count: u64,
    pub sentence_count: u64,
    pub is_question: bool,
    pub sentiment: Sentiment,
    pub processed_at: DateTime<Utc>,
}

/// One entry of the append-only session log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub origin: MessageOrigin,
    pub content: String,
    /// Only ever present on system messages.
    pub analytics: Option<MessageAnalytics>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentBreakdown {
    pub positive: u64,
    pub negative: u64,
    pub neutral: u64,
}

impl SentimentBreakdown {
    pub fn total(&self) -> u64 {
        self.positive + self.negative + self.neutral
    }

    pub fn count(&self, sentiment: Sentiment) -> u64 {
        match sentiment {
            Sentiment::Positive => self.positive,
            Sentiment::Negative => self.negative,
            Sentiment::Neutral => self.neutral,
        }
    }
}

/// Aggregate statistics as last reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub total_messages: u64,
    pub total_words: u64,
    pub questions_asked: u64,
    /// Average message length in words.
    pub avg_message_length: f64,
    pub sentiment_breakdown: SentimentBreakdown,
}

impl SessionStatistics {
    /// Share of messages that were questions, as a rounded percentage.
    pub fn question_rate_percent(&self) -> u64 {
        if self.total_messages == 0 {
            return 0;
        }
        let rate = self.questions_asked as f64 / self.total_messages as f64 * 100.0;
        rate.round() as u64
    }

    /// The sentiment with the highest tally. On a tie the later category in
    /// positive, negative, neutral order wins, so an empty tally is neutral.
    pub fn dominant_sentiment(&self) -> Sentiment {
        [Sentiment::Positive, Sentiment::Negative, Sentiment::Neutral]
            .into_iter()
            .reduce(|best, next| {
                if self.sentiment_breakdown.count(best) > self.sentiment_breakdown.count(next) {
                    best
                } else {
                    next
                }
            })
            .unwrap_or(Sentiment::Neutral)
    }
}

/// Identity of the REST-side session, assigned once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

impl SessionIdentity {
    /// First eight characters, for status lines.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}
