//! Push transport.
//!
//! One persistent WebSocket per client, shared by every channel subscription.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: connection handler with heartbeat and reconnection
//! - [`ReconnectionScheduler`]: capped, jittered backoff with attempt accounting
//! - [`MessageParser`]: Trait for parsing incoming WebSocket frames into envelopes
//! - [`TransportEvent`]: ordered stream of lifecycle changes and inbound envelopes
//!
//! # Example
//!
//! ```ignore
//! let credentials = Arc::new(StaticCredential::new(Credential::bearer(token)));
//! let connection = ConnectionManager::connect(endpoint, Config::default(), credentials).await?;
//! let mut events = connection.events();
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod reconnect;
pub mod traits;
pub mod types;

pub use config::{Config, ReconnectConfig};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStats};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use reconnect::{ReconnectionScheduler, Retry};
pub use traits::*;
pub use types::{
    ChannelKey, ChannelParams, CloseInfo, Command, CommandKind, Envelope, Payload, Termination,
    TransportEvent,
};
