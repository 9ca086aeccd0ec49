//! CLI commands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Chatpulse - realtime chat analytics client
#[derive(Parser, Debug)]
#[command(name = "chatpulse")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file (defaults to <config dir>/chatpulse/config.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Realtime endpoint, e.g. ws://localhost:8000/ws/chat
    #[arg(long)]
    pub ws_url: Option<String>,

    /// REST base URL, e.g. http://localhost:8000
    #[arg(long)]
    pub api_url: Option<String>,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long)]
    pub reconnect_delay_ms: Option<u64>,

    /// Give up after this many consecutive failed attempts
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive chat session (default)
    Chat,

    /// Probe backend health
    Health {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Session management
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Show the persisted message history of a session
    History {
        /// Session ID
        session_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Create a new session
    Create,
    /// Show a session
    Show {
        /// Session ID
        session_id: String,
    },
    /// Delete a session
    Delete {
        /// Session ID
        session_id: String,
    },
    /// Show server-side statistics for a session
    Stats {
        /// Session ID
        session_id: String,
    },
}
