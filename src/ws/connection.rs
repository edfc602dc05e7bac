#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::config::Config;
use super::reconnect::{ReconnectionScheduler, Retry};
use super::traits::{EnvelopeParser, MessageParser as _, Transport};
use super::types::{CloseInfo, Command, NORMAL_CLOSURE, Termination, TransportEvent};
use crate::Result;
use crate::auth::{Credential, CredentialProvider};
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Broadcast channel capacity for transport events.
const BROADCAST_CAPACITY: usize = 1024;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected, a reconnection may be pending
    Disconnected,
    /// Handshake in progress
    Connecting {
        /// Consecutive failures before this attempt, zero for a first connect
        attempt: u32,
    },
    /// Successfully connected
    Connected {
        /// When the connection was established
        since: Instant,
    },
    /// No further attempts will be made
    TerminallyFailed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::TerminallyFailed)
    }
}

/// Attempt bookkeeping of the connection loop.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Consecutive failures since the last successful open
    pub failures: u32,
    /// When the most recent attempt started
    pub last_attempt: Option<Instant>,
    /// When the current connection was established
    pub connected_since: Option<Instant>,
}

#[derive(Debug)]
enum Control {
    Reconnect,
    Disconnect(String),
}

/// How a live connection ended.
enum Ending {
    Lost(CloseInfo),
    Shutdown(String),
}

/// Owns the physical push connection: handshake, heartbeat, framing, reconnection.
///
/// Cloning is cheap and every clone talks to the same background connection loop. The loop
/// publishes its state through a watch channel and every lifecycle change or inbound envelope
/// through one ordered broadcast of [`TransportEvent`]s.
#[derive(Clone)]
pub struct ConnectionManager {
    /// Watch channel receiver for state changes (for use in checking the current state)
    state_rx: watch::Receiver<ConnectionState>,
    stats_rx: watch::Receiver<ConnectionStats>,
    /// Sender channel for outgoing frames
    sender_tx: mpsc::UnboundedSender<String>,
    control_tx: mpsc::UnboundedSender<Control>,
    /// Broadcast sender for lifecycle and data events
    events_tx: broadcast::Sender<TransportEvent>,
}

struct ConnectionLoop {
    endpoint: Url,
    config: Config,
    credentials: Arc<dyn CredentialProvider>,
    sender_rx: mpsc::UnboundedReceiver<String>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    events_tx: broadcast::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    stats_tx: watch::Sender<ConnectionStats>,
    parser: EnvelopeParser,
}

impl ConnectionManager {
    /// Resolve a credential and start the connection loop.
    ///
    /// Fails fast, without any retry, when the provider has no credential to offer. Every later
    /// reconnect asks the provider again.
    pub async fn connect(
        endpoint: &str,
        config: Config,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        let Some(credential) = credentials.credential().await? else {
            return Err(Error::authentication("no credential available"));
        };

        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stats_tx, stats_rx) = watch::channel(ConnectionStats::default());

        let connection_loop = ConnectionLoop {
            endpoint,
            config,
            credentials,
            sender_rx,
            control_rx,
            events_tx: events_tx.clone(),
            state_tx,
            stats_tx,
            parser: EnvelopeParser,
        };

        tokio::spawn(connection_loop.run(credential));

        Ok(Self {
            state_rx,
            stats_rx,
            sender_tx,
            control_tx,
            events_tx,
        })
    }

    /// Send a command to the server.
    ///
    /// Only meaningful while connected. Otherwise nothing is sent, a warning is logged and
    /// `Ok(false)` is returned: callers are expected to tolerate transient gaps and rely on the
    /// subscription replay that follows every reconnect.
    pub fn send<R: Serialize>(&self, request: &R) -> Result<bool> {
        if !self.state().is_connected() {
            #[cfg(feature = "tracing")]
            tracing::warn!(state = %self.state(), "Dropping outbound frame, transport not connected");
            return Ok(false);
        }

        let json = serde_json::to_string(request)?;
        if self.sender_tx.send(json).is_err() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Dropping outbound frame, connection loop has stopped");
            return Ok(false);
        }

        Ok(true)
    }

    /// Ask for an immediate reconnection attempt.
    ///
    /// Ignored while connected, while an attempt is in flight, or within `min_delay` of the
    /// previous attempt, so several trigger sites can call this freely.
    pub fn reconnect_now(&self) {
        _ = self.control_tx.send(Control::Reconnect);
    }

    /// Close the connection on purpose. The transport ends up
    /// [`ConnectionState::TerminallyFailed`] and never reconnects.
    pub fn disconnect<S: Into<String>>(&self, reason: S) {
        _ = self.control_tx.send(Control::Disconnect(reason.into()));
    }

    /// Wait until the connection loop has stopped for good.
    pub async fn terminated(&self) {
        let mut state_rx = self.state_rx.clone();
        _ = state_rx.wait_for(|state| state.is_terminal()).await;
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        *self.stats_rx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribe to lifecycle and data events.
    ///
    /// Each call returns a new independent receiver that sees events published from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }
}

impl Transport for ConnectionManager {
    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn send_command(&self, command: &Command) -> Result<bool> {
        self.send(command)
    }
}

impl ConnectionLoop {
    /// Main connection loop with automatic reconnection.
    async fn run(mut self, first_credential: Credential) {
        let mut scheduler = ReconnectionScheduler::new(self.config.reconnect.clone());
        let mut credential = Some(first_credential);

        loop {
            let current = match credential.take() {
                Some(current) => current,
                None => match self.credentials.credential().await {
                    Ok(Some(current)) => current,
                    Ok(None) => {
                        self.terminate(Termination::Authentication(
                            "no credential available".to_owned(),
                        ));
                        return;
                    }
                    Err(e) => {
                        self.terminate(Termination::Authentication(e.to_string()));
                        return;
                    }
                },
            };

            let now = Instant::now();
            scheduler.attempt_started(now);
            _ = self.state_tx.send(ConnectionState::Connecting {
                attempt: scheduler.failures(),
            });
            self.stats_tx.send_modify(|stats| stats.last_attempt = Some(now));

            let request = match self.handshake_request(&current) {
                Ok(request) => request,
                Err(e) => {
                    self.terminate(Termination::Authentication(e.to_string()));
                    return;
                }
            };

            let connected = tokio::select! {
                result = connect_async(request) => result,
                // A reconnect trigger during the handshake is coalesced into it.
                Some(Control::Disconnect(reason)) = self.control_rx.recv() => {
                    self.terminate(Termination::Shutdown(reason));
                    return;
                }
            };

            match connected {
                Ok((ws_stream, _)) => {
                    scheduler.opened();
                    self.discard_stale_frames();

                    let since = Instant::now();
                    _ = self.state_tx.send(ConnectionState::Connected { since });
                    self.stats_tx.send_modify(|stats| {
                        stats.failures = 0;
                        stats.connected_since = Some(since);
                    });
                    _ = self.events_tx.send(TransportEvent::Opened);

                    #[cfg(feature = "tracing")]
                    tracing::debug!(endpoint = %self.endpoint, "Push transport connected");

                    match self.handle_connection(ws_stream).await {
                        Ending::Shutdown(reason) => {
                            self.terminate(Termination::Shutdown(reason));
                            return;
                        }
                        Ending::Lost(info) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(code = info.code, reason = %info.reason, "Push transport lost");

                            _ = self.state_tx.send(ConnectionState::Disconnected);
                            self.stats_tx
                                .send_modify(|stats| stats.connected_since = None);
                            _ = self.events_tx.send(TransportEvent::Closed(info));
                        }
                    }
                }
                Err(tungstenite::Error::Http(response))
                    if matches!(response.status().as_u16(), 401 | 403) =>
                {
                    self.terminate(Termination::Authentication(format!(
                        "handshake refused with status {}",
                        response.status()
                    )));
                    return;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Unable to connect push transport");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;

                    _ = self.state_tx.send(ConnectionState::Disconnected);
                }
            }

            match scheduler.failed() {
                Retry::GiveUp { attempts } => {
                    self.terminate(Termination::RetriesExhausted { attempts });
                    return;
                }
                Retry::After { attempt, delay } => {
                    self.stats_tx
                        .send_modify(|stats| stats.failures = scheduler.failures());

                    #[cfg(feature = "tracing")]
                    tracing::debug!(attempt, ?delay, "Scheduling push transport reconnection");
                    #[cfg(not(feature = "tracing"))]
                    let _ = attempt;

                    if let Err(reason) = self.wait_for_retry(delay, &scheduler).await {
                        self.terminate(Termination::Shutdown(reason));
                        return;
                    }
                }
            }
        }
    }

    fn handshake_request(
        &self,
        credential: &Credential,
    ) -> Result<tungstenite::handshake::client::Request> {
        let mut request = self.endpoint.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert(AUTHORIZATION, credential.header_value()?);
        Ok(request)
    }

    /// Frames queued for a socket that died before writing them. Desired state is replayed on
    /// open instead, so sending these would duplicate subscriptions.
    fn discard_stale_frames(&mut self) {
        while self.sender_rx.try_recv().is_ok() {}
    }

    /// Sleep out the backoff delay. An accepted reconnect trigger cuts the wait short. Returns
    /// `Err(reason)` when the transport is shut down while waiting.
    async fn wait_for_retry(
        &mut self,
        delay: Duration,
        scheduler: &ReconnectionScheduler,
    ) -> std::result::Result<(), String> {
        let deadline = Instant::now() + delay;

        loop {
            tokio::select! {
                () = sleep_until(deadline) => return Ok(()),
                control = self.control_rx.recv() => match control {
                    Some(Control::Reconnect) => {
                        if scheduler.accepts_trigger(Instant::now()) {
                            return Ok(());
                        }
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Coalescing reconnect trigger");
                    }
                    Some(Control::Disconnect(reason)) => return Err(reason),
                    None => return Err("connection manager dropped".to_owned()),
                }
            }
        }
    }

    /// Handle an active WebSocket connection until it ends.
    async fn handle_connection(&mut self, ws_stream: WsStream) -> Ending {
        let (mut write, mut read) = ws_stream.split();

        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                // Handle incoming messages
                msg = read.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) if text == "PONG" => {}
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Received WebSocket text message");
                            self.publish(text.as_bytes());
                        }
                        Some(Ok(Message::Binary(bytes))) => self.publish(&bytes),
                        Some(Ok(Message::Close(frame))) => {
                            let info = frame.map_or_else(
                                || CloseInfo::new(1005, "closed without status"),
                                |frame| CloseInfo::new(u16::from(frame.code), frame.reason.as_str()),
                            );
                            return Ending::Lost(info);
                        }
                        Some(Ok(_)) => {
                            // Protocol-level PING/PONG frames are answered by tungstenite.
                        }
                        Some(Err(e)) => return Ending::Lost(CloseInfo::abnormal(e.to_string())),
                        None => return Ending::Lost(CloseInfo::abnormal("stream ended")),
                    }
                }

                // Handle outgoing frames from the subscription registry
                Some(text) = self.sender_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return Ending::Lost(CloseInfo::abnormal(e.to_string()));
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.config.heartbeat_timeout {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            "Heartbeat timeout: nothing received within {:?}",
                            self.config.heartbeat_timeout
                        );
                        return Ending::Lost(CloseInfo::abnormal("heartbeat timeout"));
                    }
                    if let Err(e) = write.send(Message::Text("PING".into())).await {
                        return Ending::Lost(CloseInfo::abnormal(e.to_string()));
                    }
                }

                control = self.control_rx.recv() => match control {
                    Some(Control::Reconnect) => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Ignoring reconnect trigger, already connected");
                    }
                    Some(Control::Disconnect(reason)) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(NORMAL_CLOSURE),
                            reason: reason.clone().into(),
                        };
                        _ = write.send(Message::Close(Some(frame))).await;
                        return Ending::Shutdown(reason);
                    }
                    None => {
                        _ = write.send(Message::Close(None)).await;
                        return Ending::Shutdown("connection manager dropped".to_owned());
                    }
                }
            }
        }
    }

    fn publish(&self, bytes: &[u8]) {
        match self.parser.parse(bytes) {
            Ok(envelopes) => {
                for envelope in envelopes {
                    _ = self.events_tx.send(TransportEvent::Message(envelope));
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "Dropping malformed push frame");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn terminate(&self, termination: Termination) {
        #[cfg(feature = "tracing")]
        match &termination {
            Termination::Shutdown(reason) => {
                tracing::debug!(%reason, "Push transport shut down");
            }
            other => tracing::error!(?other, "Push transport failed terminally"),
        }

        _ = self.state_tx.send(ConnectionState::TerminallyFailed);
        self.stats_tx
            .send_modify(|stats| stats.connected_since = None);
        _ = self.events_tx.send(TransportEvent::Terminated(termination));
    }
}
