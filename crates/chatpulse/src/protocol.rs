//! Wire codec for the realtime channel.
//!
//! The backend speaks snake_case JSON with optional fields that are
//! sometimes absent. Everything here is pure: the caller supplies the clock.
//! No other module sees wire field names.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DecodeError;
use crate::types::{
    MessageAnalytics, Sentiment, SentimentBreakdown, SessionStatistics,
};

const MESSAGE_RESPONSE: &str = "message_response";

/// Outbound frames sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEnvelope {
    UserMessage {
        content: String,
        timestamp: DateTime<Utc>,
    },
}

impl OutboundEnvelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Inbound events in canonical shape
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    MessageResponse(MessageResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageResponse {
    pub echo: Option<String>,
    pub analytics: Option<MessageAnalytics>,
    pub session_stats: Option<SessionStatistics>,
    /// The `timestamp` the backend attached, if any and if parsable.
    pub server_timestamp: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WireMessageResponse {
    #[serde(default)]
    echo: Option<String>,
    #[serde(default)]
    analytics: Option<WireAnalytics>,
    #[serde(default)]
    session_stats: Option<WireSessionStats>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAnalytics {
    word_count: u64,
    char_count: u64,
    sentence_count: u64,
    is_question: bool,
    sentiment: serde_json::Value,
    #[serde(default)]
    processed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireSessionStats {
    total_messages: u64,
    total_words: u64,
    questions_asked: u64,
    #[serde(default)]
    avg_message_length: Option<f64>,
    // The backend camel-cases this one field.
    #[serde(default, rename = "sentimentBreakdown")]
    sentiment_breakdown: Option<WireSentimentBreakdown>,
}

#[derive(Debug, Deserialize)]
struct WireSentimentBreakdown {
    #[serde(default)]
    positive: u64,
    #[serde(default)]
    negative: u64,
    #[serde(default)]
    neutral: u64,
}

/// Build the envelope for a user message. `text` must already be validated
/// as non-empty by the caller.
pub fn encode_outbound(text: &str, now: DateTime<Utc>) -> OutboundEnvelope {
    debug_assert!(!text.trim().is_empty(), "empty text reached the codec");
    OutboundEnvelope::UserMessage {
        content: text.to_string(),
        timestamp: now,
    }
}

/// Decode one transport payload. `now` is the decode-time wall clock used
/// for defaulted timestamps.
pub fn decode_inbound(
    raw: impl AsRef<[u8]>,
    now: DateTime<Utc>,
) -> Result<InboundEvent, DecodeError> {
    let value: serde_json::Value = serde_json::from_slice(raw.as_ref())
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(|kind| kind.as_str())
        .ok_or_else(|| DecodeError::MalformedPayload("missing string field 'type'".into()))?
        .to_string();

    match kind.as_str() {
        MESSAGE_RESPONSE => {
            let wire: WireMessageResponse = serde_json::from_value(value)
                .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;
            decode_message_response(wire, now).map(InboundEvent::MessageResponse)
        }
        _ => Err(DecodeError::UnknownEventKind(kind)),
    }
}

fn decode_message_response(
    wire: WireMessageResponse,
    now: DateTime<Utc>,
) -> Result<MessageResponse, DecodeError> {
    let analytics = wire
        .analytics
        .map(|analytics| decode_analytics(analytics, now))
        .transpose()?;

    Ok(MessageResponse {
        echo: wire.echo,
        analytics,
        session_stats: wire.session_stats.map(decode_session_stats),
        server_timestamp: wire.timestamp.as_deref().and_then(parse_wire_timestamp),
        received_at: now,
    })
}

fn decode_analytics(
    wire: WireAnalytics,
    now: DateTime<Utc>,
) -> Result<MessageAnalytics, DecodeError> {
    let sentiment = wire
        .sentiment
        .as_str()
        .and_then(Sentiment::from_wire)
        .ok_or_else(|| DecodeError::InvalidSentiment(wire.sentiment.to_string()))?;

    let processed_at = match wire.processed_at.as_deref() {
        Some(raw) => parse_wire_timestamp(raw).unwrap_or_else(|| {
            debug!(processed_at = raw, "Unparsable processed_at; using decode time");
            now
        }),
        None => now,
    };

    Ok(MessageAnalytics {
        word_count: wire.word_count,
        char_count: wire.char_count,
        sentence_count: wire.sentence_count,
        is_question: wire.is_question,
        sentiment,
        processed_at,
    })
}

fn decode_session_stats(wire: WireSessionStats) -> SessionStatistics {
    let sentiment_breakdown = wire
        .sentiment_breakdown
        .map(|b| SentimentBreakdown {
            positive: b.positive,
            negative: b.negative,
            neutral: b.neutral,
        })
        .unwrap_or_default();

    SessionStatistics {
        total_messages: wire.total_messages,
        total_words: wire.total_words,
        questions_asked: wire.questions_asked,
        avg_message_length: wire.avg_message_length.unwrap_or(0.0),
        sentiment_breakdown,
    }
}

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Accepts RFC 3339 and naive ISO-8601 with either a `T` or a space
/// separator (read as UTC).
pub fn parse_wire_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}
