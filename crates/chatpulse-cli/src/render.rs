//! Terminal rendering

use chatpulse::{
    ChatMessage, ConnectionState, ConnectionStatus, HistoryRecord, MessageAnalytics,
    MessageOrigin, Sentiment, SessionInfo, SessionStatistics, SessionStatsReport,
};
use colored::{ColoredString, Colorize};

pub fn rule() {
    println!("{}", "─".repeat(50).dimmed());
}

fn sentiment_label(sentiment: Sentiment) -> ColoredString {
    match sentiment {
        Sentiment::Positive => "positive".green(),
        Sentiment::Negative => "negative".red(),
        Sentiment::Neutral => "neutral".yellow(),
    }
}

fn plural(count: u64, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

pub fn analytics_line(analytics: &MessageAnalytics) -> String {
    let mut parts = vec![
        plural(analytics.word_count, "word"),
        plural(analytics.char_count, "char"),
        plural(analytics.sentence_count, "sentence"),
    ];
    if analytics.is_question {
        parts.push("question".to_string());
    }
    format!(
        "{} · {}",
        parts.join(" · ").dimmed(),
        sentiment_label(analytics.sentiment)
    )
}

pub fn message(message: &ChatMessage) {
    let time = message.created_at.format("%H:%M:%S").to_string();
    match message.origin {
        MessageOrigin::User => {
            println!("{} {} {}", time.dimmed(), "You:".green().bold(), message.content);
        }
        MessageOrigin::System => {
            println!("{} {} {}", time.dimmed(), "Echo:".blue().bold(), message.content);
            if let Some(analytics) = &message.analytics {
                println!("         {}", analytics_line(analytics));
            }
        }
    }
}

pub fn statistics(stats: &SessionStatistics) {
    println!("{}", "Session statistics".cyan().bold());
    rule();
    println!("{}: {}", "Messages".cyan(), stats.total_messages.to_string().yellow());
    println!("{}: {}", "Words".cyan(), stats.total_words.to_string().yellow());
    println!(
        "{}: {} ({}%)",
        "Questions".cyan(),
        stats.questions_asked.to_string().yellow(),
        stats.question_rate_percent()
    );
    println!(
        "{}: {:.1} words",
        "Average length".cyan(),
        stats.avg_message_length
    );
    let breakdown = &stats.sentiment_breakdown;
    println!(
        "{}: {} {} / {} {} / {} {}",
        "Sentiment".cyan(),
        breakdown.positive,
        "positive".green(),
        breakdown.negative,
        "negative".red(),
        breakdown.neutral,
        "neutral".yellow()
    );
    println!(
        "{}: {}",
        "Overall mood".cyan(),
        sentiment_label(stats.dominant_sentiment())
    );
    rule();
}

pub fn connection_state(state: ConnectionState) -> ColoredString {
    let label = state.to_string();
    match state {
        ConnectionState::Open => label.green(),
        ConnectionState::Connecting | ConnectionState::ClosedRetrying => label.yellow(),
        ConnectionState::Closing | ConnectionState::Idle => label.red(),
    }
}

pub fn status_change(status: &ConnectionStatus) {
    let mut line = format!("{} {}", "connection".dimmed(), connection_state(status.state));
    if status.state == ConnectionState::ClosedRetrying {
        if let Some(error) = &status.last_error {
            line.push_str(&format!(" {}", format!("({error})").dimmed()));
        }
    }
    println!("{line}");
}

pub fn session_info(info: &SessionInfo) {
    println!("{}: {}", "Session".cyan(), info.id.yellow());
    println!("{}: {}", "Created".cyan(), info.created_at);
    println!("{}: {}", "Messages".cyan(), info.total_messages);
    println!("{}: {}", "Words".cyan(), info.total_words);
    println!("{}: {}", "Questions".cyan(), info.questions_count);
}

pub fn stats_report(report: &SessionStatsReport) {
    // Reuse the live layout; the REST shape carries the same numbers.
    statistics(&SessionStatistics {
        total_messages: report.total_messages,
        total_words: report.total_words,
        questions_asked: report.questions_asked,
        avg_message_length: report.avg_message_length,
        sentiment_breakdown: chatpulse::SentimentBreakdown {
            positive: report.sentiment_breakdown.positive,
            negative: report.sentiment_breakdown.negative,
            neutral: report.sentiment_breakdown.neutral,
        },
    });
}

pub fn history(records: &[HistoryRecord]) {
    if records.is_empty() {
        println!("{}", "No messages yet.".dimmed());
        return;
    }
    for record in records {
        let mut meta = vec![plural(record.word_count, "word")];
        if record.is_question {
            meta.push("question".to_string());
        }
        let sentiment = match Sentiment::from_wire(&record.sentiment) {
            Some(sentiment) => sentiment_label(sentiment),
            None => record.sentiment.normal(),
        };
        println!(
            "{} {} {} {}",
            record.timestamp.dimmed(),
            record.content,
            meta.join(" · ").dimmed(),
            sentiment
        );
    }
}

pub fn chat_help() {
    println!("{}", "Commands:".cyan().bold());
    println!("  {}     show session statistics", "/stats".yellow());
    println!("  {}   show persisted history", "/history".yellow());
    println!("  {}    show connection status", "/status".yellow());
    println!("  {}     probe backend health again", "/retry".yellow());
    println!("  {}      exit", "/quit".yellow());
}
