#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

//! Desired-state set of channel subscriptions.
//!
//! The registry remembers every channel a consumer asked for, independently of whether the
//! transport is up. On every open of the transport the whole set is replayed in registration
//! order; a confirmation or a rejection from the server only ever affects its own channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::mpsc;

use crate::Result;
use crate::error::{Error, SubscriptionRejected};
use crate::types::ResourceType;
use crate::ws::Transport;
use crate::ws::types::{
    ChannelKey, ChannelParams, Command, Envelope, Payload, SUBSCRIPTION_CONFIRMED, TransportEvent,
};

/// A channel the consumer wants to receive, and the resource it keeps fresh.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub key: ChannelKey,
    pub resource: ResourceType,
}

impl ChannelDescriptor {
    #[must_use]
    pub fn new<S: Into<String>>(name: S, params: ChannelParams, resource: ResourceType) -> Self {
        Self {
            key: ChannelKey::new(name, params),
            resource,
        }
    }

    /// The usual shape: channel named after the resource, scoped to one tenant.
    #[must_use]
    pub fn for_tenant(resource: ResourceType, tenant: &str) -> Self {
        let name = resource.as_str().to_owned();
        Self::new(name, ChannelParams::new().with("tenant", tenant), resource)
    }
}

/// Events delivered to the holder of a [`Subscription`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The server confirmed the subscription.
    Connected,
    /// The transport dropped. The subscription is replayed once it comes back.
    Disconnected,
    /// The server refused the subscription. Terminal for this channel.
    Rejected(String),
    Message(Payload),
}

/// Lifecycle of one registry entry.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Recorded, waiting for the transport or for the server's confirmation
    Pending,
    Confirmed,
    Rejected(String),
}

impl ChannelStatus {
    #[must_use]
    pub const fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Receiving end of a channel subscription.
#[derive(Debug)]
pub struct Subscription {
    key: ChannelKey,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Subscription {
    #[must_use]
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Next event, or `None` once the channel was unsubscribed.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.events.try_recv().ok()
    }
}

/// Answers "is this resource currently kept fresh by push?".
pub trait Coverage: Send + Sync + 'static {
    fn is_covered(&self, resource: &ResourceType) -> bool;
}

#[derive(Debug)]
struct RegistryEntry {
    descriptor: ChannelDescriptor,
    seq: u64,
    status: ChannelStatus,
    listeners: Vec<mpsc::UnboundedSender<ChannelEvent>>,
}

impl RegistryEntry {
    fn notify(&mut self, event: &ChannelEvent) {
        self.listeners
            .retain(|listener| listener.send(event.clone()).is_ok());
    }
}

/// Manages desired subscriptions and routes inbound envelopes to their subscribers.
pub struct SubscriptionRegistry {
    transport: Arc<dyn Transport>,
    entries: DashMap<ChannelKey, RegistryEntry>,
    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Record `descriptor` and subscribe on the wire if the transport is connected.
    ///
    /// Idempotent by channel key: a second call for the same key adds a receiver to the existing
    /// entry and sends nothing. A late receiver is told the entry's current status right away.
    pub fn subscribe(&self, descriptor: ChannelDescriptor) -> Result<Subscription> {
        let key = descriptor.key.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let is_new = match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let current = match &entry.status {
                    ChannelStatus::Pending => None,
                    ChannelStatus::Confirmed => Some(ChannelEvent::Connected),
                    ChannelStatus::Rejected(reason) => Some(ChannelEvent::Rejected(reason.clone())),
                };
                if let Some(event) = current {
                    _ = tx.send(event);
                }
                entry.listeners.push(tx);
                false
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(RegistryEntry {
                    descriptor,
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    status: ChannelStatus::Pending,
                    listeners: vec![tx],
                });
                true
            }
        };

        if is_new {
            let command = Command::subscribe(&key);
            #[cfg(feature = "tracing")]
            tracing::debug!(channel = %key, command = %command.command, "Sending channel command");
            self.transport.send_command(&command)?;
        }

        Ok(Subscription { key, events: rx })
    }

    /// Forget `key`. The unsubscribe command is only sent while connected; otherwise dropping the
    /// desired state is enough. Returns whether an entry existed.
    pub fn unsubscribe(&self, key: &ChannelKey) -> Result<bool> {
        let Some((_, entry)) = self.entries.remove(key) else {
            return Ok(false);
        };

        if !entry.status.is_rejected() && self.transport.is_connected() {
            self.transport.send_command(&Command::unsubscribe(key))?;
        }

        Ok(true)
    }

    /// Re-send every recorded, non-rejected subscription in registration order. Returns how many
    /// were sent.
    pub fn replay_all(&self) -> usize {
        let mut keys: Vec<(u64, ChannelKey)> = self
            .entries
            .iter_mut()
            .filter(|entry| !entry.status.is_rejected())
            .map(|mut entry| {
                entry.status = ChannelStatus::Pending;
                (entry.seq, entry.key().clone())
            })
            .collect();
        keys.sort_unstable_by_key(|(seq, _)| *seq);

        #[cfg(feature = "tracing")]
        tracing::debug!(count = keys.len(), "Replaying subscriptions");

        let mut sent = 0;
        for (_, key) in &keys {
            match self.transport.send_command(&Command::subscribe(key)) {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(channel = %key, error = %e, "Failed to replay subscription");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }
        sent
    }

    /// Deliver an inbound envelope to the entry with the same channel identity.
    ///
    /// Returns a protocol error when no entry matches; the envelope is dropped.
    pub fn route(&self, envelope: Envelope) -> Result<()> {
        let key = envelope.key();
        let Some(mut entry) = self.entries.get_mut(&key) else {
            return Err(Error::protocol(format!(
                "no subscription for channel {key}"
            )));
        };

        if entry.status.is_rejected() {
            return Ok(());
        }

        let payload = envelope.payload;
        let event = if !payload.is_control() {
            ChannelEvent::Message(payload)
        } else if payload.kind == SUBSCRIPTION_CONFIRMED {
            entry.status = ChannelStatus::Confirmed;
            ChannelEvent::Connected
        } else {
            let reason = payload
                .get("reason")
                .and_then(|reason| reason.as_str())
                .unwrap_or("rejected by server")
                .to_owned();

            let error = Error::from(SubscriptionRejected {
                channel: key.to_string(),
                reason: reason.clone(),
            });
            #[cfg(feature = "tracing")]
            tracing::warn!(%error, "Channel subscription refused");
            #[cfg(not(feature = "tracing"))]
            let _ = &error;

            entry.status = ChannelStatus::Rejected(reason.clone());
            ChannelEvent::Rejected(reason)
        };

        entry.notify(&event);
        Ok(())
    }

    /// Tell every live entry the transport is gone. Entries stay recorded for replay.
    pub fn mark_disconnected(&self) {
        for mut entry in self.entries.iter_mut() {
            if entry.status.is_rejected() {
                continue;
            }
            entry.status = ChannelStatus::Pending;
            entry.notify(&ChannelEvent::Disconnected);
        }
    }

    /// Apply one transport event: replay on open, fan out disconnects, route messages.
    pub fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                self.replay_all();
            }
            TransportEvent::Closed(_) | TransportEvent::Terminated(_) => self.mark_disconnected(),
            TransportEvent::Message(envelope) => {
                if let Err(e) = self.route(envelope) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Dropping unroutable envelope");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }
    }

    #[must_use]
    pub fn status(&self, key: &ChannelKey) -> Option<ChannelStatus> {
        self.entries.get(key).map(|entry| entry.status.clone())
    }

    /// Recorded channel keys in registration order.
    #[must_use]
    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<(u64, ChannelKey)> = self
            .entries
            .iter()
            .map(|entry| (entry.seq, entry.key().clone()))
            .collect();
        keys.sort_unstable_by_key(|(seq, _)| *seq);
        keys.into_iter().map(|(_, key)| key).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Coverage for SubscriptionRegistry {
    fn is_covered(&self, resource: &ResourceType) -> bool {
        self.transport.is_connected()
            && self.entries.iter().any(|entry| {
                entry.descriptor.resource == *resource && !entry.status.is_rejected()
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::ws::types::{CloseInfo, CommandKind, SUBSCRIPTION_REJECTED};

    #[derive(Default)]
    struct RecordingTransport {
        connected: AtomicBool,
        sent: Mutex<Vec<Command>>,
    }

    impl RecordingTransport {
        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
        }

        fn take(&self) -> Vec<Command> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    impl Transport for RecordingTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send_command(&self, command: &Command) -> Result<bool> {
            if !self.is_connected() {
                return Ok(false);
            }
            self.sent.lock().unwrap().push(command.clone());
            Ok(true)
        }
    }

    fn registry() -> (Arc<RecordingTransport>, SubscriptionRegistry) {
        let transport = Arc::new(RecordingTransport::default());
        let registry = SubscriptionRegistry::new(Arc::clone(&transport) as Arc<dyn Transport>);
        (transport, registry)
    }

    fn orders() -> ChannelDescriptor {
        ChannelDescriptor::for_tenant(ResourceType::from("orders"), "42")
    }

    fn menu() -> ChannelDescriptor {
        ChannelDescriptor::for_tenant(ResourceType::from("menu_items"), "42")
    }

    fn envelope(descriptor: &ChannelDescriptor, payload: Payload) -> Envelope {
        Envelope::new(
            descriptor.key.name.clone(),
            descriptor.key.params.clone(),
            payload,
        )
    }

    #[test]
    fn tenant_channel_is_named_after_resource() {
        let descriptor = orders();

        assert_eq!(descriptor.key.name, "orders");
        assert_eq!(descriptor.resource, ResourceType::from("orders"));
        assert_eq!(
            descriptor.key,
            ChannelKey::new("orders", ChannelParams::new().with("tenant", 42))
        );
    }

    #[test]
    fn subscribe_is_idempotent() {
        let (transport, registry) = registry();
        transport.set_connected(true);

        let _first = registry.subscribe(orders()).unwrap();
        let _second = registry.subscribe(orders()).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(transport.take().len(), 1);
    }

    #[test]
    fn subscribe_while_disconnected_is_deferred_and_replayed() {
        let (transport, registry) = registry();

        let _orders = registry.subscribe(orders()).unwrap();
        let _menu = registry.subscribe(menu()).unwrap();
        assert!(transport.take().is_empty());

        transport.set_connected(true);
        registry.handle_event(TransportEvent::Opened);

        let sent = transport.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], Command::subscribe(&orders().key));
        assert_eq!(sent[1], Command::subscribe(&menu().key));
    }

    #[test]
    fn replay_keeps_registration_order() {
        let (transport, registry) = registry();
        let names = ["orders", "menu_items", "inventory", "settings"];
        let _subs: Vec<_> = names
            .iter()
            .map(|name| {
                registry
                    .subscribe(ChannelDescriptor::for_tenant(ResourceType::from(*name), "7"))
                    .unwrap()
            })
            .collect();

        transport.set_connected(true);
        for _ in 0..3 {
            assert_eq!(registry.replay_all(), 4);
            let channels: Vec<_> = transport.take().into_iter().map(|c| c.channel).collect();
            assert_eq!(channels, names);
        }
        assert_eq!(
            registry.keys().iter().map(|k| k.name.as_str()).collect::<Vec<_>>(),
            names
        );
    }

    #[test]
    fn unsubscribe_only_sends_while_connected() {
        let (transport, registry) = registry();
        let _orders = registry.subscribe(orders()).unwrap();
        let _menu = registry.subscribe(menu()).unwrap();

        assert!(registry.unsubscribe(&orders().key).unwrap());
        assert!(transport.take().is_empty());

        transport.set_connected(true);
        assert!(registry.unsubscribe(&menu().key).unwrap());
        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command, CommandKind::Unsubscribe);

        assert!(!registry.unsubscribe(&menu().key).unwrap());
        assert!(registry.is_empty());
    }

    #[test]
    fn routes_lifecycle_and_data() {
        let (transport, registry) = registry();
        transport.set_connected(true);
        let mut sub = registry.subscribe(orders()).unwrap();

        registry
            .route(envelope(&orders(), Payload::new(SUBSCRIPTION_CONFIRMED)))
            .unwrap();
        registry
            .route(envelope(
                &orders(),
                Payload::new("entity_deleted").with("id", 5),
            ))
            .unwrap();

        assert_eq!(sub.try_recv(), Some(ChannelEvent::Connected));
        let Some(ChannelEvent::Message(payload)) = sub.try_recv() else {
            panic!("expected message");
        };
        assert_eq!(payload.kind, "entity_deleted");
        assert_eq!(registry.status(sub.key()), Some(ChannelStatus::Confirmed));
    }

    #[test]
    fn unmatched_envelope_is_protocol_error() {
        let (_, registry) = registry();
        let _orders = registry.subscribe(orders()).unwrap();

        let other_tenant = Envelope::new(
            "orders",
            ChannelParams::new().with("tenant", 43),
            Payload::new("entity_created"),
        );
        let err = registry.route(other_tenant).unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Protocol);
    }

    #[test]
    fn rejection_is_scoped_and_terminal() {
        let (transport, registry) = registry();
        transport.set_connected(true);
        let mut rejected = registry.subscribe(orders()).unwrap();
        let mut healthy = registry.subscribe(menu()).unwrap();
        transport.take();

        registry
            .route(envelope(
                &orders(),
                Payload::new(SUBSCRIPTION_REJECTED).with("reason", "forbidden"),
            ))
            .unwrap();
        registry
            .route(envelope(&menu(), Payload::new(SUBSCRIPTION_CONFIRMED)))
            .unwrap();

        assert_eq!(
            rejected.try_recv(),
            Some(ChannelEvent::Rejected("forbidden".to_owned()))
        );
        assert_eq!(healthy.try_recv(), Some(ChannelEvent::Connected));

        assert!(!registry.is_covered(&orders().resource));
        assert!(registry.is_covered(&menu().resource));

        registry.replay_all();
        let sent = transport.take();
        assert_eq!(sent, vec![Command::subscribe(&menu().key)]);

        let mut late = registry.subscribe(orders()).unwrap();
        assert_eq!(
            late.try_recv(),
            Some(ChannelEvent::Rejected("forbidden".to_owned()))
        );
    }

    #[test]
    fn disconnect_fans_out_and_coverage_follows_transport() {
        let (transport, registry) = registry();
        transport.set_connected(true);
        let mut sub = registry.subscribe(orders()).unwrap();
        assert!(registry.is_covered(&orders().resource));

        transport.set_connected(false);
        registry.handle_event(TransportEvent::Closed(CloseInfo::abnormal("gone")));

        assert_eq!(sub.try_recv(), Some(ChannelEvent::Disconnected));
        assert!(!registry.is_covered(&orders().resource));
        assert_eq!(registry.status(sub.key()), Some(ChannelStatus::Pending));
        assert!(!registry.is_covered(&ResourceType::from("inventory")));
    }
}
