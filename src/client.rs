//! Composition root: one push connection, one subscription registry, one polling manager and any
//! number of tracked views.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use orderdesk_sync::auth::{Credential, StaticCredential};
//! use orderdesk_sync::types::Record;
//! use orderdesk_sync::{Config, SyncClient};
//!
//! # async fn example() -> orderdesk_sync::Result<()> {
//! let config = Config::builder()
//!     .push_endpoint("wss://push.example.com/ws")
//!     .rest_host("https://api.example.com/")
//!     .tenant("42")
//!     .build();
//! let credentials = Arc::new(StaticCredential::new(Credential::bearer("token")));
//!
//! let client = SyncClient::init(config, credentials)?;
//! let orders = client.track::<Record, _>("orders").await?;
//! orders.set_page(2).await;
//! println!("{:?}", orders.snapshot().view.items);
//!
//! client.teardown().await;
//! # Ok(())
//! # }
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bon::Builder;
use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::Result;
use crate::auth::CredentialProvider;
use crate::coordinator::{ConsistencyCoordinator, PageFetcher, Reconcile, ViewConfig};
use crate::error::Error;
use crate::polling::{PollHandler, PollOptions, PollingManager};
use crate::rest::RestClient;
use crate::subscription::{
    ChannelDescriptor, ChannelEvent, Coverage, Subscription, SubscriptionRegistry,
};
use crate::task::{TaskHandle, spawn_until_cancelled};
use crate::types::{Entity, ResourceType};
use crate::ws::{self, ConnectionManager, ConnectionState, Termination, TransportEvent};

const ERROR_CHANNEL_CAPACITY: usize = 16;
const TEARDOWN_REASON: &str = "client teardown";

/// Configuration of a [`SyncClient`].
#[derive(Clone, Debug, Builder)]
pub struct Config {
    /// WebSocket endpoint of the push channel
    #[builder(into)]
    push_endpoint: String,
    /// Base URL of the REST collections
    #[builder(into)]
    rest_host: String,
    /// Tenant scope sent as the `tenant` channel parameter
    #[builder(into)]
    tenant: String,
    /// Options of the fallback pollers
    #[builder(default)]
    poll: PollOptions,
    #[builder(default)]
    transport: ws::Config,
    /// Defaults of views created through [`SyncClient::track`]
    #[builder(default)]
    view: ViewConfig,
}

impl Config {
    #[must_use]
    pub fn tenant(&self) -> &str {
        &self.tenant
    }
}

type ViewTable = DashMap<ResourceType, Vec<(u64, Arc<dyn Reconcile>)>>;

/// Refreshes every view of the polled resource.
struct ResourcePoller {
    views: Arc<ViewTable>,
}

#[async_trait]
impl PollHandler for ResourcePoller {
    async fn poll(&self, resource: &ResourceType, silent: bool) -> Result<()> {
        let views = views_of(&self.views, resource);
        futures::future::join_all(views.iter().map(|view| view.reconcile(silent))).await;
        Ok(())
    }
}

fn views_of(table: &ViewTable, resource: &ResourceType) -> Vec<Arc<dyn Reconcile>> {
    table
        .get(resource)
        .map(|views| views.iter().map(|(_, view)| Arc::clone(view)).collect())
        .unwrap_or_default()
}

fn all_views(table: &ViewTable) -> Vec<Arc<dyn Reconcile>> {
    table
        .iter()
        .flat_map(|entry| {
            entry
                .value()
                .iter()
                .map(|(_, view)| Arc::clone(view))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Everything that exists only once the push connection was requested.
struct Session {
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    polling: Arc<PollingManager>,
    poller: Arc<dyn PollHandler>,
    _router: TaskHandle,
}

impl Session {
    async fn start(inner: &ClientInner) -> Result<Self> {
        let connection = ConnectionManager::connect(
            &inner.config.push_endpoint,
            inner.config.transport.clone(),
            Arc::clone(&inner.credentials),
        )
        .await?;
        // Subscribe before yielding so the first lifecycle event is not missed.
        let events = connection.events();

        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(connection.clone())));
        let polling = Arc::new(PollingManager::new(
            Arc::clone(&registry) as Arc<dyn Coverage>
        ));
        let poller: Arc<dyn PollHandler> = Arc::new(ResourcePoller {
            views: Arc::clone(&inner.views),
        });

        let router = Router {
            registry: Arc::clone(&registry),
            polling: Arc::clone(&polling),
            poller: Arc::clone(&poller),
            poll_options: inner.config.poll.clone(),
            views: Arc::clone(&inner.views),
            errors_tx: inner.errors_tx.clone(),
        };

        Ok(Self {
            connection,
            registry,
            polling,
            poller,
            _router: spawn_until_cancelled(router.run(events)),
        })
    }
}

/// Applies transport events in the order they were published.
struct Router {
    registry: Arc<SubscriptionRegistry>,
    polling: Arc<PollingManager>,
    poller: Arc<dyn PollHandler>,
    poll_options: PollOptions,
    views: Arc<ViewTable>,
    errors_tx: broadcast::Sender<Arc<Error>>,
}

impl Router {
    async fn run(self, mut events: broadcast::Receiver<TransportEvent>) {
        let mut opened_before = false;
        // Dropped with the router, which cancels a catch-up still in flight.
        let mut catch_up: Option<TaskHandle> = None;

        loop {
            match events.recv().await {
                Ok(TransportEvent::Message(envelope)) => {
                    self.registry
                        .handle_event(TransportEvent::Message(envelope));
                }
                Ok(event) => {
                    self.registry.handle_event(event.clone());
                    match event {
                        TransportEvent::Opened => {
                            self.polling.stop_covered();
                            // Changes pushed while disconnected are gone; catch up once.
                            if opened_before {
                                catch_up = Some(self.reconcile_all());
                            }
                            opened_before = true;
                        }
                        TransportEvent::Closed(_) => self.fall_back(),
                        TransportEvent::Terminated(termination) => {
                            if !matches!(termination, Termination::Shutdown(_)) {
                                self.fall_back();
                            }
                            let error = Error::from(termination);
                            if error.is_actionable() {
                                _ = self.errors_tx.send(Arc::new(error));
                            }
                            break;
                        }
                        TransportEvent::Message(_) => {}
                    }
                }
                Err(RecvError::Lagged(count)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        error = %ws::WsError::Lagged { count },
                        "Transport events lagged, reconciling every view"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = &count;
                    catch_up = Some(self.reconcile_all());
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Start a poller for every tracked resource push does not cover.
    fn fall_back(&self) {
        let resources: Vec<ResourceType> =
            self.views.iter().map(|entry| entry.key().clone()).collect();
        for resource in resources {
            self.polling
                .start_polling(resource, Arc::clone(&self.poller), &self.poll_options);
        }
    }

    /// Refetch every tracked view in the background. A newer catch-up replaces the last one.
    fn reconcile_all(&self) -> TaskHandle {
        let views = all_views(&self.views);
        spawn_until_cancelled(async move {
            futures::future::join_all(views.iter().map(|view| view.reconcile(true))).await;
        })
    }
}

struct ClientInner {
    config: Config,
    credentials: Arc<dyn CredentialProvider>,
    rest: RestClient,
    session: OnceCell<Session>,
    views: Arc<ViewTable>,
    next_view: AtomicU64,
    errors_tx: broadcast::Sender<Arc<Error>>,
}

impl ClientInner {
    fn untrack(&self, resource: &ResourceType, id: u64) {
        if let Some(mut views) = self.views.get_mut(resource) {
            views.retain(|(view_id, _)| *view_id != id);
        }
        if self
            .views
            .remove_if(resource, |_, views| views.is_empty())
            .is_none()
        {
            return;
        }

        let Some(session) = self.session.get() else {
            return;
        };
        let descriptor = ChannelDescriptor::for_tenant(resource.clone(), &self.config.tenant);
        if let Err(e) = session.registry.unsubscribe(&descriptor.key) {
            #[cfg(feature = "tracing")]
            tracing::warn!(%resource, error = %e, "Failed to unsubscribe");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
        session.polling.stop_resource(resource);
    }
}

/// Real-time synchronization client.
///
/// Created explicitly with [`SyncClient::init`] and torn down with [`SyncClient::teardown`].
/// The push connection is opened lazily by the first [`SyncClient::track`]. Cloning is cheap and
/// every clone shares the same connection and views.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    /// Validates the configuration and builds the REST client. Does not connect.
    pub fn init(config: Config, credentials: Arc<dyn CredentialProvider>) -> Result<Self> {
        let rest = RestClient::new(&config.rest_host, Arc::clone(&credentials))?;
        let (errors_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                credentials,
                rest,
                session: OnceCell::new(),
                views: Arc::new(DashMap::new()),
                next_view: AtomicU64::new(0),
                errors_tx,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[must_use]
    pub fn rest(&self) -> &RestClient {
        &self.inner.rest
    }

    async fn session(&self) -> Result<&Session> {
        self.inner
            .session
            .get_or_try_init(|| Session::start(&self.inner))
            .await
    }

    /// Keep `resource` fresh in a new paginated view fetched through the REST client.
    pub async fn track<T: Entity, R: Into<ResourceType>>(
        &self,
        resource: R,
    ) -> Result<TrackedView<T>> {
        let fetcher: Arc<dyn PageFetcher<T>> = Arc::new(self.inner.rest.clone());
        let config = self.inner.config.view.clone();
        self.track_with(resource.into(), fetcher, &config).await
    }

    /// Like [`SyncClient::track`] with an explicit fetcher and view configuration.
    ///
    /// Opens the push connection on first use and fails fast when no credential is available.
    /// Subscribes the resource's channel, starts a fallback poller when push does not cover the
    /// resource yet, and loads the first page before returning.
    pub async fn track_with<T: Entity>(
        &self,
        resource: ResourceType,
        fetcher: Arc<dyn PageFetcher<T>>,
        config: &ViewConfig,
    ) -> Result<TrackedView<T>> {
        let session = self.session().await?;
        #[cfg(feature = "tracing")]
        if session.connection.state().is_terminal() {
            tracing::warn!(%resource, "Push transport stopped, view relies on polling");
        }

        let coordinator = ConsistencyCoordinator::new(resource.clone(), fetcher, config);
        let subscription = session.registry.subscribe(ChannelDescriptor::for_tenant(
            resource.clone(),
            &self.inner.config.tenant,
        ))?;

        let id = self.inner.next_view.fetch_add(1, Ordering::Relaxed);
        self.inner
            .views
            .entry(resource.clone())
            .or_default()
            .push((id, Arc::new(coordinator.clone()) as Arc<dyn Reconcile>));

        if !session.registry.is_covered(&resource) {
            session.polling.start_polling(
                resource.clone(),
                Arc::clone(&session.poller),
                &self.inner.config.poll,
            );
        }

        let pump = spawn_until_cancelled(pump(
            subscription,
            coordinator.clone(),
            Arc::clone(&session.polling),
            Arc::clone(&session.poller),
            self.inner.config.poll.clone(),
        ));

        let tracked = TrackedView {
            coordinator,
            id,
            resource,
            client: Arc::downgrade(&self.inner),
            _pump: pump,
        };
        tracked.coordinator.refresh(false).await;

        Ok(tracked)
    }

    /// Ask the transport to reconnect now, e.g. when the dashboard becomes visible again.
    pub fn reconnect_now(&self) {
        if let Some(session) = self.inner.session.get() {
            session.connection.reconnect_now();
        }
    }

    /// State of the push connection, `None` before the first [`SyncClient::track`].
    #[must_use]
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.inner
            .session
            .get()
            .map(|session| session.connection.state())
    }

    /// Whether push currently keeps `resource` fresh.
    #[must_use]
    pub fn is_covered(&self, resource: &ResourceType) -> bool {
        self.inner
            .session
            .get()
            .is_some_and(|session| session.registry.is_covered(resource))
    }

    /// Whether a fallback poller runs for `resource`.
    #[must_use]
    pub fn is_polling(&self, resource: &ResourceType) -> bool {
        self.inner
            .session
            .get()
            .is_some_and(|session| session.polling.is_active(resource))
    }

    /// Resources with at least one tracked view, sorted.
    #[must_use]
    pub fn tracked_resources(&self) -> Vec<ResourceType> {
        let mut resources: Vec<ResourceType> = self
            .inner
            .views
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        resources.sort();
        resources
    }

    /// Failures the user has to act on: authentication, or reconnection giving up. Everything
    /// else heals on its own and is only logged.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<Arc<Error>> {
        self.inner.errors_tx.subscribe()
    }

    /// Close the push connection for good, stop every poller and release every view.
    pub async fn teardown(&self) {
        for view in all_views(&self.inner.views) {
            view.release();
        }
        self.inner.views.clear();

        if let Some(session) = self.inner.session.get() {
            session.polling.stop_all();
            session.connection.disconnect(TEARDOWN_REASON);
            session.connection.terminated().await;
        }
    }
}

/// Feeds one view from its channel subscription.
async fn pump<T: Entity>(
    mut subscription: Subscription,
    coordinator: ConsistencyCoordinator<T>,
    polling: Arc<PollingManager>,
    poller: Arc<dyn PollHandler>,
    poll_options: PollOptions,
) {
    while let Some(event) = subscription.recv().await {
        match event {
            ChannelEvent::Message(payload) => {
                if let Err(e) = coordinator.apply_push(&payload) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        resource = %coordinator.resource(),
                        error = %e,
                        "Dropping unmergeable payload"
                    );
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
            ChannelEvent::Rejected(reason) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(resource = %coordinator.resource(), %reason, "Falling back to polling");
                #[cfg(not(feature = "tracing"))]
                let _ = &reason;

                polling.start_polling(
                    coordinator.resource().clone(),
                    Arc::clone(&poller),
                    &poll_options,
                );
            }
            ChannelEvent::Connected | ChannelEvent::Disconnected => {}
        }
    }
}

/// A paginated view kept fresh by the client. Dereferences to its [`ConsistencyCoordinator`].
///
/// Dropping it releases the view and, for the last view of a resource, unsubscribes the channel
/// and stops the resource's poller.
pub struct TrackedView<T: Entity> {
    coordinator: ConsistencyCoordinator<T>,
    id: u64,
    resource: ResourceType,
    client: Weak<ClientInner>,
    _pump: TaskHandle,
}

impl<T: Entity> TrackedView<T> {
    #[must_use]
    pub fn resource(&self) -> &ResourceType {
        &self.resource
    }

    #[must_use]
    pub fn coordinator(&self) -> &ConsistencyCoordinator<T> {
        &self.coordinator
    }
}

impl<T: Entity> Deref for TrackedView<T> {
    type Target = ConsistencyCoordinator<T>;

    fn deref(&self) -> &Self::Target {
        &self.coordinator
    }
}

impl<T: Entity> Drop for TrackedView<T> {
    fn drop(&mut self) {
        self.coordinator.close();
        if let Some(inner) = self.client.upgrade() {
            inner.untrack(&self.resource, self.id);
        }
    }
}
