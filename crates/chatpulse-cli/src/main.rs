//! Chatpulse - realtime chat analytics client

use anyhow::{bail, Context, Result};
use chatpulse::{
    BackendApi, BootstrapState, ClientConfig, ConnectionState, MessageOrigin, RequestGateway,
    SendError, SessionOrchestrator,
};
use clap::Parser;
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;
mod render;

use commands::{Cli, Commands, SessionCommands};

#[tokio::main]
async fn main() {
    // Logs go to stderr so they don't interleave with the chat transcript
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Ok(config) => match &cli.command {
            None | Some(Commands::Chat) => run_chat(&config).await,
            Some(Commands::Health { json }) => run_health(&config, *json).await,
            Some(Commands::Session { command }) => run_session(command, &config).await,
            Some(Commands::History { session_id, json }) => {
                run_history(&config, session_id, *json).await
            }
        },
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = ClientConfig::load(cli.config.as_deref())?;

    if let Some(url) = &cli.ws_url {
        config.ws_url = url.clone();
    }
    if let Some(url) = &cli.api_url {
        config.api_url = url.clone();
    }
    if let Some(delay) = cli.reconnect_delay_ms {
        config.reconnect.delay_ms = delay;
    }
    if let Some(max) = cli.max_reconnect_attempts {
        config.reconnect.max_attempts = Some(max);
    }

    tracing::debug!(?config, "Resolved configuration");
    Ok(config)
}

async fn run_health(config: &ClientConfig, json_output: bool) -> Result<()> {
    let gateway = RequestGateway::from_config(config)?;
    let health = gateway
        .health()
        .await
        .with_context(|| format!("probing {}", gateway.base_url()))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&health)?);
    } else {
        let status = if health.is_healthy() {
            health.status.green()
        } else {
            health.status.red()
        };
        println!("{}: {}", "Status".cyan(), status.bold());
        println!(
            "{}: {}",
            "Active connections".cyan(),
            health.active_connections.to_string().yellow()
        );
        if let Some(timestamp) = &health.timestamp {
            println!("{}: {}", "Server time".cyan(), timestamp.dimmed());
        }
    }

    if !health.is_healthy() {
        bail!("backend reported status '{}'", health.status);
    }
    Ok(())
}

async fn run_session(command: &SessionCommands, config: &ClientConfig) -> Result<()> {
    let gateway = RequestGateway::from_config(config)?;

    match command {
        SessionCommands::Create => {
            let info = gateway.create_session().await?;
            println!("{} {}", "Created session:".green().bold(), info.id.yellow());
        }
        SessionCommands::Show { session_id } => {
            let info = gateway.get_session(session_id).await?;
            render::session_info(&info);
        }
        SessionCommands::Delete { session_id } => {
            gateway.delete_session(session_id).await?;
            println!("{} {}", "Deleted session:".green().bold(), session_id.yellow());
        }
        SessionCommands::Stats { session_id } => {
            let report = gateway.session_stats(session_id).await?;
            render::stats_report(&report);
        }
    }
    Ok(())
}

async fn run_history(config: &ClientConfig, session_id: &str, json_output: bool) -> Result<()> {
    let gateway = RequestGateway::from_config(config)?;
    let history = gateway.message_history(session_id).await?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&history)?);
    } else {
        render::history(&history.messages);
    }
    Ok(())
}

async fn run_chat(config: &ClientConfig) -> Result<()> {
    let mut orchestrator = SessionOrchestrator::from_config(config)?;
    let mut status = orchestrator.connection().watch_status();

    println!("{}", "Chatpulse".cyan().bold());
    println!("{}", format!("Connecting to {}", config.ws_url).dimmed());
    start_session(&mut orchestrator).await;
    println!("{}", "Type a message, /help for commands.".dimmed());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_input(&mut orchestrator, line.trim()).await {
                    break;
                }
            }
            Some(snapshot) = orchestrator.next_update() => {
                if let Some(message) = snapshot
                    .last_message()
                    .filter(|m| m.origin == MessageOrigin::System)
                {
                    render::message(message);
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                render::status_change(&current);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    orchestrator.shutdown().await;
    println!("{}", "Bye.".dimmed());
    Ok(())
}

async fn start_session(orchestrator: &mut SessionOrchestrator) {
    if let Err(e) = orchestrator.start().await {
        println!("{} {}", "Backend unavailable:".red().bold(), e);
        println!("{}", "Use /retry to probe again.".dimmed());
        return;
    }

    match orchestrator.bootstrap_state() {
        BootstrapState::Degraded { reason } => {
            println!("{} {}", "No session:".yellow().bold(), reason);
        }
        _ => {
            if let Some(session) = orchestrator.session() {
                println!("{} {}", "Session".cyan(), session.short_id().yellow());
            }
        }
    }
}

/// Returns `false` when the user asked to leave.
async fn handle_input(orchestrator: &mut SessionOrchestrator, input: &str) -> bool {
    match input {
        "" => {}
        "/quit" | "/exit" => return false,
        "/help" => render::chat_help(),
        "/stats" => render::statistics(&orchestrator.snapshot().statistics),
        "/status" => {
            let status = orchestrator.connection().status();
            println!(
                "{}: {}",
                "Connection".cyan(),
                render::connection_state(status.state)
            );
            if let Some(error) = &status.last_error {
                println!("{}: {}", "Last error".cyan(), error.to_string().dimmed());
            }
            if let Some(session) = orchestrator.session() {
                println!("{}: {}", "Session".cyan(), session.id.yellow());
            }
        }
        "/history" => match orchestrator.message_history().await {
            Ok(history) => render::history(&history.messages),
            Err(e) => println!("{} {}", "History unavailable:".red(), e),
        },
        "/retry" => match orchestrator.retry_health_probe().await {
            Ok(_) if orchestrator.connection_state() == ConnectionState::Idle => {
                println!("{}", "Backend healthy.".green());
                start_session(orchestrator).await;
            }
            Ok(_) => println!("{}", "Backend healthy.".green()),
            Err(e) => println!("{} {}", "Still unavailable:".red(), e),
        },
        text => match orchestrator.send_user_message(text).await {
            Ok(_) => {}
            Err(SendError::NotConnected) => {
                println!("{}", "Not connected; message not sent.".yellow());
            }
            Err(e) => println!("{} {}", "Send failed:".red(), e),
        },
    }
    true
}
