#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use super::types::Termination;
use crate::error::{Authentication, Error, Kind, RetriesExhausted};

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error parsing a WebSocket message
    MessageParse(serde_json::Error),
    /// WebSocket connection was closed
    ConnectionClosed,
    /// The transport was shut down on purpose
    Shutdown(String),
    /// Received an invalid or unexpected message
    InvalidMessage(String),
    /// Event stream lagged and missed messages
    Lagged {
        /// Number of messages that were missed
        count: u64,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::MessageParse(e) => write!(f, "Failed to parse WebSocket message: {e}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Shutdown(reason) => write!(f, "WebSocket transport shut down: {reason}"),
            Self::InvalidMessage(msg) => write!(f, "Invalid WebSocket message: {msg}"),
            Self::Lagged { count } => write!(f, "Event stream lagged, missed {count} messages"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        let kind = match e {
            WsError::MessageParse(_) | WsError::InvalidMessage(_) => Kind::Protocol,
            WsError::Shutdown(_) => Kind::Validation,
            _ => Kind::Network,
        };
        Error::with_source(kind, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::with_source(Kind::Network, WsError::Connection(e))
    }
}

impl From<Termination> for Error {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Authentication(reason) => Authentication { reason }.into(),
            Termination::RetriesExhausted { attempts } => RetriesExhausted { attempts }.into(),
            Termination::Shutdown(reason) => WsError::Shutdown(reason).into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminations_map_to_kinds() {
        let auth: Error = Termination::Authentication("401".to_owned()).into();
        let exhausted: Error = Termination::RetriesExhausted { attempts: 10 }.into();
        let shutdown: Error = Termination::Shutdown("unmount".to_owned()).into();

        assert_eq!(auth.kind(), Kind::Authentication);
        assert_eq!(exhausted.kind(), Kind::Network);
        assert!(exhausted.is_actionable());
        assert!(!shutdown.is_actionable());
    }

    #[test]
    fn invalid_message_is_protocol_error() {
        let error: Error = WsError::InvalidMessage("no channel".to_owned()).into();

        assert_eq!(error.kind(), Kind::Protocol);
        assert!(!error.is_actionable());
    }
}
