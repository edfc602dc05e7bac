//! Async driver of one [`ViewState`]: dispatches fetches, applies pushed changes, runs marker
//! timers and publishes snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::Result;
use crate::error::Error;
use crate::task::{TaskHandle, spawn_after};
use crate::types::{Entity, EntityId, Filters, ResourceType};
use crate::view::{
    Applied, EntityChange, Merge, Page, PageQuery, RequestToken, ViewSnapshot, ViewState,
};
use crate::ws::types::Payload;

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
const DEFAULT_MARKER_TTL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_PAGE_JUMP: u32 = 5;
const DEFAULT_PER_PAGE: u32 = 25;
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Fetches one page of a resource.
#[async_trait]
pub trait PageFetcher<T: Entity>: Send + Sync + 'static {
    async fn fetch(&self, resource: &ResourceType, query: &PageQuery) -> Result<Page<T>>;
}

/// Type-erased handle on a view, used by pollers, reconnect catch-up and teardown.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Re-fetch what the view shows.
    async fn reconcile(&self, silent: bool);

    fn release(&self);
}

/// Tuning of one paginated view.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ViewConfig {
    /// Window within which an identical change is ignored.
    #[builder(default = DEFAULT_DEBOUNCE)]
    pub debounce: Duration,
    /// Lifetime of a new-entity marker.
    #[builder(default = DEFAULT_MARKER_TTL)]
    pub marker_ttl: Duration,
    /// Largest accepted growth of `total_pages` between two applied responses.
    #[builder(default = DEFAULT_MAX_PAGE_JUMP)]
    pub max_page_jump: u32,
    #[builder(default = DEFAULT_PER_PAGE)]
    pub per_page: u32,
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct Inner<T: Entity> {
    resource: ResourceType,
    fetcher: Arc<dyn PageFetcher<T>>,
    state: Mutex<ViewState<T>>,
    snapshot_tx: watch::Sender<ViewSnapshot<T>>,
    errors_tx: broadcast::Sender<Arc<Error>>,
    marker_timers: Mutex<HashMap<EntityId, TaskHandle>>,
}

/// Single writer of one paginated view.
///
/// User changes, pushed changes and poll refreshes all go through here. A response only reaches
/// the view if it answers the most recently issued request; pushed changes are merged
/// immediately and never wait for fetches in flight.
pub struct ConsistencyCoordinator<T: Entity> {
    inner: Arc<Inner<T>>,
}

impl<T: Entity> Clone for ConsistencyCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity> ConsistencyCoordinator<T> {
    #[must_use]
    pub fn new(resource: ResourceType, fetcher: Arc<dyn PageFetcher<T>>, config: &ViewConfig) -> Self {
        let state = ViewState::new(
            config.per_page,
            config.debounce,
            config.marker_ttl,
            config.max_page_jump,
        );
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        let (errors_tx, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                resource,
                fetcher,
                state: Mutex::new(state),
                snapshot_tx,
                errors_tx,
                marker_timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    #[must_use]
    pub fn resource(&self) -> &ResourceType {
        &self.inner.resource
    }

    fn state(&self) -> MutexGuard<'_, ViewState<T>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &ViewState<T>) {
        self.inner.snapshot_tx.send_replace(state.snapshot());
    }

    /// Go to `page`, keeping filters and sort.
    pub async fn set_page(&self, page: u32) -> Applied {
        let target = self.query().with_page(page);
        self.change(target).await
    }

    /// Replace the filters. Returns to the first page.
    pub async fn set_filters(&self, filters: Filters) -> Applied {
        let target = self.query().with_page(1).with_filters(filters);
        self.change(target).await
    }

    /// Replace the sort order. Returns to the first page.
    pub async fn set_sort<S: Into<String> + Send>(&self, sort: Option<S>) -> Applied {
        let target = self.query().with_page(1).with_sort(sort);
        self.change(target).await
    }

    /// Move the view to `target` and fetch it.
    ///
    /// The view takes the target's page, filters and sort before this method first yields. The
    /// returned future resolves once the fetch has been applied, discarded or has failed.
    pub async fn change(&self, target: PageQuery) -> Applied {
        let dispatched = {
            let mut state = self.state();
            match state.request(target.clone(), Instant::now()) {
                Some(token) => {
                    self.publish(&state);
                    Some(token)
                }
                None if state.is_released() => return Applied::Released,
                None => None,
            }
        };

        match dispatched {
            Some(token) => self.dispatch(token, target).await,
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(resource = %self.inner.resource, "Debounced identical view change");
                Applied::Debounced
            }
        }
    }

    /// Re-fetch what the view currently shows. `silent` keeps the loading state untouched.
    pub async fn refresh(&self, silent: bool) -> Applied {
        let dispatched = {
            let mut state = self.state();
            let token = state.refresh(silent);
            if token.is_some() {
                self.publish(&state);
            }
            token.map(|token| (token, state.query()))
        };

        match dispatched {
            Some((token, query)) => self.dispatch(token, query).await,
            None => Applied::Released,
        }
    }

    async fn dispatch(&self, mut token: RequestToken, mut query: PageQuery) -> Applied {
        loop {
            let result = self.inner.fetcher.fetch(&self.inner.resource, &query).await;

            (token, query) = {
                let mut state = self.state();
                match result {
                    Ok(page) => match state.apply(token, page) {
                        Applied::Diverged => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!(
                                resource = %self.inner.resource,
                                "Page count diverged, forcing refetch"
                            );
                            (state.force_refetch(), state.query())
                        }
                        outcome => {
                            if outcome == Applied::Applied {
                                self.publish(&state);
                            } else {
                                #[cfg(feature = "tracing")]
                                tracing::debug!(
                                    resource = %self.inner.resource,
                                    token = token.value(),
                                    "Discarding superseded response"
                                );
                            }
                            return outcome;
                        }
                    },
                    Err(e) => {
                        if !state.fail(token) {
                            return if state.is_released() {
                                Applied::Released
                            } else {
                                Applied::Superseded
                            };
                        }
                        self.publish(&state);
                        drop(state);

                        #[cfg(feature = "tracing")]
                        tracing::warn!(resource = %self.inner.resource, error = %e, "Page fetch failed");
                        _ = self.inner.errors_tx.send(Arc::new(e));
                        return Applied::Failed;
                    }
                }
            };
        }
    }

    /// Merge a pushed payload into the view.
    pub fn apply_push(&self, payload: &Payload) -> Result<Merge> {
        let change = EntityChange::<T>::from_payload(payload)?;
        let merge = {
            let mut state = self.state();
            let merge = state.merge(change, Instant::now());
            if merge != Merge::Ignored {
                self.publish(&state);
            }
            merge
        };

        match &merge {
            Merge::Marked(id, expires) => self.schedule_expiry(id.clone(), *expires),
            Merge::Removed | Merge::Appended => {
                if let Some(id) = merge_id(payload) {
                    self.cancel_expiry(&id);
                }
            }
            Merge::Updated | Merge::Ignored => {}
        }

        Ok(merge)
    }

    fn schedule_expiry(&self, id: EntityId, expires: Instant) {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let timer_id = id.clone();
        let delay = expires.saturating_duration_since(Instant::now());

        let handle = spawn_after(delay, move || async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let coordinator = Self { inner };
            let expired = {
                let mut state = coordinator.state();
                let expired = state.markers_mut().expire(&timer_id, Instant::now());
                if expired {
                    coordinator.publish(&state);
                }
                expired
            };
            if expired {
                coordinator
                    .inner
                    .marker_timers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&timer_id);
            }
        });

        self.inner
            .marker_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle);
    }

    fn cancel_expiry(&self, id: &EntityId) {
        self.inner
            .marker_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    /// Release the view: later responses and merges are no-ops and marker timers stop.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.release();
            self.publish(&state);
        }
        self.inner
            .marker_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().is_released()
    }

    #[must_use]
    pub fn query(&self) -> PageQuery {
        self.state().query()
    }

    #[must_use]
    pub fn latest_token(&self) -> RequestToken {
        self.state().latest()
    }

    #[must_use]
    pub fn snapshot(&self) -> ViewSnapshot<T> {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receiver of every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewSnapshot<T>> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Fetch failures of the latest request. Superseded failures are never reported.
    #[must_use]
    pub fn errors(&self) -> broadcast::Receiver<Arc<Error>> {
        self.inner.errors_tx.subscribe()
    }
}

/// Id named by a created or deleted payload, used to drop its expiry timer.
fn merge_id(payload: &Payload) -> Option<EntityId> {
    let value = payload
        .get("id")
        .or_else(|| payload.get("entity").and_then(|entity| entity.get("id")))?;
    serde::Deserialize::deserialize(value).ok()
}

#[async_trait]
impl<T: Entity> Reconcile for ConsistencyCoordinator<T> {
    async fn reconcile(&self, silent: bool) {
        _ = self.refresh(silent).await;
    }

    fn release(&self) {
        self.close();
    }
}
