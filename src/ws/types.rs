//! Wire types of the push channel.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload type of a server confirmation for one channel subscription.
pub const SUBSCRIPTION_CONFIRMED: &str = "subscription_confirmed";
/// Payload type of a server refusal for one channel subscription.
pub const SUBSCRIPTION_REJECTED: &str = "subscription_rejected";
pub const ENTITY_CREATED: &str = "entity_created";
pub const ENTITY_UPDATED: &str = "entity_updated";
pub const ENTITY_DELETED: &str = "entity_deleted";

/// Close code used when the socket went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code used for caller-initiated teardown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Channel parameters, canonicalized: keys ordered, scalar values rendered as strings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelParams(BTreeMap<String, String>);

impl ChannelParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with<K: Into<String>, V: ToString>(mut self, key: K, value: V) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ChannelParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str("&")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        Ok(())
    }
}

impl<'de> Deserialize<'de> for ChannelParams {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
        let mut params = BTreeMap::new();
        for (key, value) in raw {
            let value = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "channel parameter {key} must be a scalar, got {other}"
                    )));
                }
            };
            params.insert(key, value);
        }
        Ok(Self(params))
    }
}

/// Identity of a channel subscription: name plus canonical parameters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelKey {
    pub name: String,
    pub params: ChannelParams,
}

impl ChannelKey {
    #[must_use]
    pub fn new<S: Into<String>>(name: S, params: ChannelParams) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}?{}", self.name, self.params)
        }
    }
}

/// Message payload: a `type` discriminator plus arbitrary fields.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Payload {
    #[must_use]
    pub fn new<S: Into<String>>(kind: S) -> Self {
        Self {
            kind: kind.into(),
            data: Map::new(),
        }
    }

    #[must_use]
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Whether this is a channel lifecycle control frame rather than data.
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.kind == SUBSCRIPTION_CONFIRMED || self.kind == SUBSCRIPTION_REJECTED
    }
}

/// Inbound push envelope.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    #[serde(default)]
    pub params: ChannelParams,
    pub payload: Payload,
}

impl Envelope {
    #[must_use]
    pub fn new<S: Into<String>>(channel: S, params: ChannelParams, payload: Payload) -> Self {
        Self {
            channel: channel.into(),
            params,
            payload,
        }
    }

    #[must_use]
    pub fn key(&self) -> ChannelKey {
        ChannelKey::new(self.channel.clone(), self.params.clone())
    }
}

/// Outbound channel command.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Command {
    pub command: CommandKind,
    pub channel: String,
    pub params: ChannelParams,
}

impl Command {
    #[must_use]
    pub fn subscribe(key: &ChannelKey) -> Self {
        Self {
            command: CommandKind::Subscribe,
            channel: key.name.clone(),
            params: key.params.clone(),
        }
    }

    #[must_use]
    pub fn unsubscribe(key: &ChannelKey) -> Self {
        Self {
            command: CommandKind::Unsubscribe,
            channel: key.name.clone(),
            params: key.params.clone(),
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
}

/// Close code and reason of a lost connection.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    #[must_use]
    pub fn new<S: Into<String>>(code: u16, reason: S) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn abnormal<S: Into<String>>(reason: S) -> Self {
        Self::new(ABNORMAL_CLOSURE, reason)
    }
}

/// Why the transport stopped for good.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    /// No credential, or the handshake was refused with 401/403.
    Authentication(String),
    /// Reconnection gave up.
    RetriesExhausted { attempts: u32 },
    /// Caller-initiated teardown.
    Shutdown(String),
}

/// Lifecycle and data events published by the transport, in the order they happened.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Opened,
    Closed(CloseInfo),
    Message(Envelope),
    Terminated(Termination),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn params_are_canonical() {
        let from_wire: ChannelParams =
            serde_json::from_value(json!({ "tenant": 42, "scope": "kitchen" })).unwrap();
        let built = ChannelParams::new()
            .with("scope", "kitchen")
            .with("tenant", 42);

        assert_eq!(from_wire, built);
        assert_eq!(built.to_string(), "scope=kitchen&tenant=42");
    }

    #[test]
    fn nested_params_are_rejected() {
        let result = serde_json::from_value::<ChannelParams>(json!({ "tenant": { "id": 1 } }));
        assert!(result.is_err());
    }

    #[test]
    fn envelope_parses_and_keys() {
        let envelope: Envelope = serde_json::from_value(json!({
            "channel": "orders",
            "params": { "tenant": 42 },
            "payload": { "type": "entity_updated", "entity": { "id": 1 } }
        }))
        .unwrap();

        assert_eq!(envelope.payload.kind, ENTITY_UPDATED);
        assert_eq!(envelope.payload.get("entity"), Some(&json!({ "id": 1 })));
        assert_eq!(envelope.key().to_string(), "orders?tenant=42");
        assert!(!envelope.payload.is_control());
    }

    #[test]
    fn envelope_without_params() {
        let envelope: Envelope = serde_json::from_value(json!({
            "channel": "settings",
            "payload": { "type": "subscription_confirmed" }
        }))
        .unwrap();

        assert!(envelope.params.is_empty());
        assert!(envelope.payload.is_control());
        assert_eq!(envelope.key().to_string(), "settings");
    }

    #[test]
    fn command_serializes() {
        let key = ChannelKey::new("orders", ChannelParams::new().with("tenant", 42));

        assert_eq!(
            serde_json::to_value(Command::subscribe(&key)).unwrap(),
            json!({ "command": "subscribe", "channel": "orders", "params": { "tenant": "42" } })
        );
        assert_eq!(
            serde_json::to_value(Command::unsubscribe(&key)).unwrap()["command"],
            json!("unsubscribe")
        );
    }

    #[test]
    fn command_kind_displays_like_its_wire_name() {
        assert_eq!(CommandKind::Subscribe.to_string(), "subscribe");
        assert_eq!(CommandKind::Unsubscribe.to_string(), "unsubscribe");
    }
}
