#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Each test binary uses a different subset of the helpers"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use orderdesk_sync::auth::{Credential, StaticCredential};
use orderdesk_sync::polling::PollOptions;
use orderdesk_sync::types::Record;
use orderdesk_sync::view::Page;
use orderdesk_sync::ws;
use orderdesk_sync::{Config, SyncClient};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

pub const TOKEN: &str = "secret-token";
pub const TENANT: &str = "42";
pub const ORDERS: &str = "orders";

/// Mock push server.
///
/// Accepts any number of sequential or concurrent connections. Every accepted handshake records
/// its `Authorization` header, every text frame other than `PING` is forwarded as a command.
pub struct MockPushServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    message_tx: broadcast::Sender<String>,
    /// Receives parsed channel commands from clients
    command_rx: mpsc::UnboundedReceiver<Value>,
    /// Receives the `Authorization` header of each handshake
    auth_rx: mpsc::UnboundedReceiver<Option<String>>,
    /// Receives the code and reason of each close frame sent by a client
    close_rx: mpsc::UnboundedReceiver<(u16, String)>,
    /// Bumping this drops every live connection without a close frame
    generation: watch::Sender<u64>,
    /// HTTP status returned to new handshakes, 101 to accept them
    handshake_status: Arc<AtomicU16>,
}

impl MockPushServer {
    /// Start a mock push server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<String>(100);
        let (command_tx, command_rx) = mpsc::unbounded_channel::<Value>();
        let (auth_tx, auth_rx) = mpsc::unbounded_channel::<Option<String>>();
        let (close_tx, close_rx) = mpsc::unbounded_channel::<(u16, String)>();
        let (generation, _) = watch::channel(0_u64);
        let handshake_status = Arc::new(AtomicU16::new(StatusCode::SWITCHING_PROTOCOLS.as_u16()));

        let broadcast_tx = message_tx.clone();
        let generation_tx = generation.clone();
        let status = Arc::clone(&handshake_status);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let auth_tx = auth_tx.clone();
                let refuse_with = status.load(Ordering::SeqCst);
                let callback = move |request: &Request, response: Response| {
                    let header = request
                        .headers()
                        .get("authorization")
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_owned);
                    drop(auth_tx.send(header));

                    if refuse_with == StatusCode::SWITCHING_PROTOCOLS.as_u16() {
                        Ok(response)
                    } else {
                        let mut refusal = ErrorResponse::new(Some("refused".to_owned()));
                        *refusal.status_mut() = StatusCode::from_u16(refuse_with).unwrap();
                        Err(refusal)
                    }
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let command_tx = command_tx.clone();
                let close_tx = close_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();
                let mut generation_rx = generation_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) if text == "PING" => {
                                        if write.send(Message::Text("PONG".into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Some(Ok(Message::Text(text))) => {
                                        if let Ok(command) = serde_json::from_str(&text) {
                                            drop(command_tx.send(command));
                                        }
                                    }
                                    Some(Ok(Message::Close(frame))) => {
                                        if let Some(frame) = frame {
                                            drop(close_tx.send((
                                                u16::from(frame.code),
                                                frame.reason.to_string(),
                                            )));
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(text) => {
                                        if write.send(Message::Text(text.into())).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            // Dropping both halves closes the socket without a close frame.
                            _ = generation_rx.changed() => break,
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            command_rx,
            auth_rx,
            close_rx,
            generation,
            handshake_status,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Send a raw frame to all connected clients.
    pub fn send(&self, frame: &str) {
        drop(self.message_tx.send(frame.to_owned()));
    }

    /// Send a push envelope on `channel` scoped to the test tenant.
    pub fn push(&self, channel: &str, payload: &Value) {
        let envelope = json!({
            "channel": channel,
            "params": { "tenant": TENANT },
            "payload": payload,
        });
        self.send(&envelope.to_string());
    }

    /// Drop every live connection abruptly.
    pub fn drop_connections(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    /// Answer future handshakes with `status` instead of upgrading.
    pub fn refuse_handshakes(&self, status: StatusCode) {
        self.handshake_status.store(status.as_u16(), Ordering::SeqCst);
    }

    pub fn accept_handshakes(&self) {
        self.refuse_handshakes(StatusCode::SWITCHING_PROTOCOLS);
    }

    /// Receive the next channel command.
    pub async fn recv_command(&mut self) -> Option<Value> {
        timeout(Duration::from_secs(2), self.command_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the `Authorization` header of the next handshake.
    pub async fn recv_auth(&mut self) -> Option<Option<String>> {
        timeout(Duration::from_secs(2), self.auth_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next close frame a client sent.
    pub async fn recv_close(&mut self) -> Option<(u16, String)> {
        timeout(Duration::from_secs(2), self.close_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait until no command arrives for `quiet`, returning what did arrive.
    pub async fn drain_commands(&mut self, quiet: Duration) -> Vec<Value> {
        let mut commands = Vec::new();
        while let Ok(Some(command)) = timeout(quiet, self.command_rx.recv()).await {
            commands.push(command);
        }
        commands
    }
}

pub fn subscribe_command(channel: &str) -> Value {
    json!({ "command": "subscribe", "channel": channel, "params": { "tenant": TENANT } })
}

pub fn unsubscribe_command(channel: &str) -> Value {
    json!({ "command": "unsubscribe", "channel": channel, "params": { "tenant": TENANT } })
}

pub fn confirmed() -> Value {
    json!({ "type": "subscription_confirmed" })
}

/// Transport tuned for tests: quick retries, a short cap and few attempts.
pub fn fast_transport(max_attempts: u32) -> ws::Config {
    let mut transport = ws::Config::default();
    transport.reconnect.min_delay = Duration::from_millis(50);
    transport.reconnect.max_delay = Duration::from_millis(200);
    transport.reconnect.max_attempts = max_attempts;
    transport
}

pub fn config(push_endpoint: &str, rest_host: &str, transport: ws::Config) -> Config {
    Config::builder()
        .push_endpoint(push_endpoint)
        .rest_host(rest_host)
        .tenant(TENANT)
        .transport(transport)
        .poll(
            PollOptions::builder()
                .interval(Duration::from_millis(100))
                .jitter(0.0)
                .build(),
        )
        .build()
}

pub fn client(push_endpoint: &str, rest_host: &str, transport: ws::Config) -> SyncClient {
    let credentials = Arc::new(StaticCredential::new(Credential::bearer(TOKEN)));
    SyncClient::init(config(push_endpoint, rest_host, transport), credentials).unwrap()
}

/// First page of three orders out of `total_count`.
pub fn orders_page(total_count: u64) -> Value {
    let items = vec![
        Record::new(1_u64).with_field("status", "pending"),
        Record::new(2_u64).with_field("status", "pending"),
        Record::new(3_u64).with_field("status", "served"),
    ];
    serde_json::to_value(Page::new(items, 1, 25, total_count)).unwrap()
}

/// Poll `condition` every few milliseconds until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}
