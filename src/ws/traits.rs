//! Core traits for the push transport.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::error::WsError;
use super::types::{Command, Envelope};

/// Message parser trait for converting raw frames to messages.
///
/// # Example
///
/// ```ignore
/// pub struct SimpleParser;
///
/// impl MessageParser<MyMessage> for SimpleParser {
///     fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<MyMessage>> {
///         let msg: MyMessage = serde_json::from_slice(bytes)?;
///         Ok(vec![msg])
///     }
/// }
/// ```
pub trait MessageParser<M: DeserializeOwned>: Send + Sync + 'static {
    /// Parse incoming bytes into messages.
    ///
    /// Handles both single objects and arrays of messages.
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<M>>;
}

/// Outbound side of the push transport, as seen by the subscription registry.
pub trait Transport: Send + Sync + 'static {
    /// Whether a socket is open right now.
    fn is_connected(&self) -> bool;

    /// Queue `command` for the open socket. Returns `Ok(false)` when nothing was sent because the
    /// transport is not connected.
    fn send_command(&self, command: &Command) -> crate::Result<bool>;
}

/// Parses `{ channel, params, payload }` envelopes, singly or batched in an array.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct EnvelopeParser;

impl MessageParser<Envelope> for EnvelopeParser {
    fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<Envelope>> {
        let value: Value = serde_json::from_slice(bytes).map_err(WsError::MessageParse)?;

        match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| {
                    serde_json::from_value(item).map_err(|e| WsError::MessageParse(e).into())
                })
                .collect(),
            Value::Object(_) => Ok(vec![
                serde_json::from_value(value).map_err(WsError::MessageParse)?,
            ]),
            other => Err(WsError::InvalidMessage(format!("expected envelope, got {other}")).into()),
        }
    }
}
