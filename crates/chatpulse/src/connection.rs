//! Realtime connection lifecycle.
//!
//! A single actor task owns the socket, the retry deadline and the attempt
//! generation. Dialing and reading happen in helper tasks that report back
//! with generation-tagged [`LinkEvent`]s; anything tagged with an older
//! generation is dropped on arrival.

use std::time::Duration;

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{SendError, TransportError};
use crate::protocol::{decode_inbound, InboundEvent, OutboundEnvelope};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    ClosedRetrying,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::ClosedRetrying => write!(f, "closed-retrying"),
        }
    }
}

/// Point-in-time view of the connection for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<TransportError>,
    /// Consecutive failed attempts since the link was last open.
    pub failed_attempts: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            last_error: None,
            failed_attempts: 0,
        }
    }
}

enum Command {
    Connect,
    Send {
        envelope: OutboundEnvelope,
        reply: oneshot::Sender<Result<(), SendError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
    SubscribeEvents(mpsc::UnboundedSender<InboundEvent>),
    SubscribeStatus(mpsc::UnboundedSender<ConnectionState>),
}

enum LinkEvent {
    Established {
        generation: u64,
        stream: Box<WsStream>,
    },
    Failed {
        generation: u64,
        error: TransportError,
    },
    Frame {
        generation: u64,
        payload: Vec<u8>,
    },
    Closed {
        generation: u64,
        error: Option<TransportError>,
    },
}

impl LinkEvent {
    fn generation(&self) -> u64 {
        match self {
            LinkEvent::Established { generation, .. }
            | LinkEvent::Failed { generation, .. }
            | LinkEvent::Frame { generation, .. }
            | LinkEvent::Closed { generation, .. } => *generation,
        }
    }
}

/// Handle to the connection actor. Dropping it tears the connection down.
pub struct ConnectionManager {
    url: String,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionManager {
    /// Spawn the actor. Must be called inside a tokio runtime.
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self::with_connect_timeout(url, policy, DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::with_connect_timeout(
            config.ws_url.clone(),
            config.reconnect.clone(),
            config.connect_timeout(),
        )
    }

    pub fn with_connect_timeout(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        connect_timeout: Duration,
    ) -> Self {
        let url = url.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());

        let actor = ConnectionActor {
            url: url.clone(),
            policy,
            connect_timeout,
            state: ConnectionState::Idle,
            generation: 0,
            desired_active: false,
            failed_attempts: 0,
            last_error: None,
            retry_at: None,
            sink: None,
            dialer: None,
            reader: None,
            link_tx,
            status_tx,
            event_subscribers: Vec::new(),
            status_subscribers: Vec::new(),
        };
        tokio::spawn(actor.run(command_rx, link_rx));

        Self {
            url,
            commands: command_tx,
            status: status_rx,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Start connecting. No-op while `Open` or `Connecting`.
    pub fn connect(&self) {
        if self.commands.send(Command::Connect).is_err() {
            warn!("Connection actor has stopped; connect ignored");
        }
    }

    /// Transmit one envelope. Fails with `NotConnected` unless the link is
    /// open; nothing is queued for later.
    pub async fn send(&self, envelope: OutboundEnvelope) -> Result<(), SendError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Send { envelope, reply })
            .map_err(|_| SendError::NotConnected)?;
        response.await.unwrap_or(Err(SendError::NotConnected))
    }

    /// Close the link, cancel any pending retry and settle at `Idle`.
    /// A later [`connect`](Self::connect) starts a fresh lifecycle.
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_ok() {
            let _ = finished.await;
        }
    }

    /// Decoded inbound events, in wire order.
    pub fn subscribe_events(&self) -> mpsc::UnboundedReceiver<InboundEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::SubscribeEvents(tx));
        rx
    }

    /// Every state transition, in order.
    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<ConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::SubscribeStatus(tx));
        rx
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

struct ConnectionActor {
    url: String,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    state: ConnectionState,
    generation: u64,
    desired_active: bool,
    failed_attempts: u32,
    last_error: Option<TransportError>,
    retry_at: Option<Instant>,
    sink: Option<WsSink>,
    dialer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    event_subscribers: Vec<mpsc::UnboundedSender<InboundEvent>>,
    status_subscribers: Vec<mpsc::UnboundedSender<ConnectionState>>,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut links: mpsc::UnboundedReceiver<LinkEvent>,
    ) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(link) = links.recv() => self.handle_link(link),
                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_due();
                }
            }
        }
        debug!(url = %self.url, "Connection actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Send { envelope, reply } => {
                let result = self.send(envelope).await;
                let _ = reply.send(result);
            }
            Command::Shutdown { done } => {
                self.shutdown().await;
                let _ = done.send(());
            }
            Command::SubscribeEvents(tx) => self.event_subscribers.push(tx),
            Command::SubscribeStatus(tx) => self.status_subscribers.push(tx),
        }
    }

    fn connect(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            debug!(state = %self.state, "Connect ignored; link already active");
            return;
        }

        if !self.desired_active {
            self.failed_attempts = 0;
            self.last_error = None;
        }
        self.desired_active = true;
        self.retry_at = None;
        self.begin_attempt();
    }

    fn begin_attempt(&mut self) {
        if let Some(dialer) = self.dialer.take() {
            dialer.abort();
        }

        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);

        let url = self.url.clone();
        let connect_timeout = self.connect_timeout;
        let links = self.link_tx.clone();
        info!(url = %url, generation, "Connecting to realtime endpoint");

        self.dialer = Some(tokio::spawn(async move {
            let attempt = tokio::time::timeout(
                connect_timeout,
                tokio_tungstenite::connect_async(url.as_str()),
            )
            .await;

            let event = match attempt {
                Ok(Ok((stream, _))) => LinkEvent::Established {
                    generation,
                    stream: Box::new(stream),
                },
                Ok(Err(e)) => LinkEvent::Failed {
                    generation,
                    error: TransportError::ConnectFailed(e.to_string()),
                },
                Err(_) => LinkEvent::Failed {
                    generation,
                    error: TransportError::Timeout(connect_timeout.as_millis() as u64),
                },
            };
            let _ = links.send(event);
        }));
    }

    fn handle_link(&mut self, link: LinkEvent) {
        let generation = link.generation();
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "Discarding event from superseded connection attempt"
            );
            return;
        }

        match link {
            LinkEvent::Established { stream, .. } => self.on_established(*stream),
            LinkEvent::Failed { error, .. } => self.on_attempt_failed(error),
            LinkEvent::Frame { payload, .. } => self.on_frame(&payload),
            LinkEvent::Closed { error, .. } => self.on_closed(error),
        }
    }

    fn on_established(&mut self, stream: WsStream) {
        self.dialer = None;
        let (sink, mut frames) = stream.split();
        let links = self.link_tx.clone();
        let generation = self.generation;

        self.reader = Some(tokio::spawn(async move {
            let error = loop {
                let payload = match frames.next().await {
                    Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                    Some(Ok(Message::Binary(data))) => data.to_vec(),
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Realtime connection closed by server");
                        break None;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(TransportError::Reset(e.to_string())),
                    None => break None,
                };
                if links.send(LinkEvent::Frame { generation, payload }).is_err() {
                    return;
                }
            };
            let _ = links.send(LinkEvent::Closed { generation, error });
        }));

        self.sink = Some(sink);
        self.failed_attempts = 0;
        self.last_error = None;
        info!(url = %self.url, generation, "Realtime connection open");
        self.set_state(ConnectionState::Open);
    }

    fn on_attempt_failed(&mut self, error: TransportError) {
        self.dialer = None;
        self.failed_attempts += 1;
        warn!(
            error = %error,
            failed_attempts = self.failed_attempts,
            "Connection attempt failed"
        );
        self.last_error = Some(error);
        self.schedule_retry();
    }

    fn on_frame(&mut self, payload: &[u8]) {
        match decode_inbound(payload, Utc::now()) {
            Ok(event) => {
                self.event_subscribers
                    .retain(|subscriber| subscriber.send(event.clone()).is_ok());
            }
            Err(e) => warn!(error = %e, "Discarding inbound payload"),
        }
    }

    fn on_closed(&mut self, error: Option<TransportError>) {
        self.sink = None;
        self.reader = None;
        if let Some(error) = error {
            warn!(error = %error, "Realtime connection lost");
            self.last_error = Some(error);
        } else {
            info!("Realtime connection closed");
        }

        if self.desired_active {
            self.schedule_retry();
        } else {
            self.set_state(ConnectionState::Idle);
        }
    }

    fn schedule_retry(&mut self) {
        if !self.policy.allows_retry(self.failed_attempts) {
            warn!(
                failed_attempts = self.failed_attempts,
                "Reconnect attempts exhausted; giving up"
            );
            self.desired_active = false;
            self.retry_at = None;
            self.set_state(ConnectionState::Idle);
            return;
        }

        let delay = self.policy.delay();
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::ClosedRetrying);
    }

    fn retry_due(&mut self) {
        self.retry_at = None;
        if self.desired_active && self.state == ConnectionState::ClosedRetrying {
            self.begin_attempt();
        }
    }

    async fn send(&mut self, envelope: OutboundEnvelope) -> Result<(), SendError> {
        if self.state != ConnectionState::Open {
            return Err(SendError::NotConnected);
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(SendError::NotConnected);
        };

        let json = envelope
            .to_json()
            .map_err(|e| SendError::Encode(e.to_string()))?;

        if let Err(e) = sink.send(Message::Text(json.into())).await {
            warn!(error = %e, "Failed to write to realtime connection");
            return Err(TransportError::Reset(e.to_string()).into());
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.desired_active = false;
        self.retry_at = None;
        // Anything still in flight belongs to a dead generation now.
        self.generation += 1;

        if let Some(dialer) = self.dialer.take() {
            dialer.abort();
        }

        if let Some(mut sink) = self.sink.take() {
            self.set_state(ConnectionState::Closing);
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Error while closing realtime connection"),
                Err(_) => debug!("Timed out sending close frame"),
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        self.set_state(ConnectionState::Idle);
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "Connection state changed");
            self.state = next;
            self.status_subscribers
                .retain(|subscriber| subscriber.send(next).is_ok());
        }
        self.status_tx.send_replace(ConnectionStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            failed_attempts: self.failed_attempts,
        });
    }
}
