//! REST polling fallback, active only for resources that push does not currently cover.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::subscription::Coverage;
use crate::task::{TaskHandle, spawn_every};
use crate::types::ResourceType;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_POLL_JITTER: f64 = 0.15;

/// Work performed on every poll tick.
#[async_trait]
pub trait PollHandler: Send + Sync + 'static {
    /// `silent` is true for background reconciliation, which must not raise loading indicators.
    async fn poll(&self, resource: &ResourceType, silent: bool) -> Result<()>;
}

/// Per-poller options.
///
/// ```
/// use std::time::Duration;
/// use orderdesk_sync::polling::PollOptions;
///
/// let options = PollOptions::builder()
///     .interval(Duration::from_secs(10))
///     .silent(false)
///     .build();
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct PollOptions {
    /// Mean time between ticks.
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    pub interval: Duration,
    #[builder(default = true)]
    pub silent: bool,
    /// Relative spread of the tick interval.
    #[builder(default = DEFAULT_POLL_JITTER)]
    pub jitter: f64,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Identifies one running poller. Cloning does not duplicate the poller.
#[derive(Debug, Clone)]
pub struct PollHandle {
    resource: ResourceType,
    id: u64,
    token: CancellationToken,
}

impl PollHandle {
    #[must_use]
    pub fn resource(&self) -> &ResourceType {
        &self.resource
    }

    /// Whether the poller may still tick.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct Poller {
    handle: PollHandle,
    task: TaskHandle,
}

type PollerTable = Arc<Mutex<HashMap<ResourceType, Poller>>>;

/// Keeps at most one live poller per resource type.
pub struct PollingManager {
    coverage: Arc<dyn Coverage>,
    pollers: PollerTable,
    next_id: AtomicU64,
}

impl PollingManager {
    #[must_use]
    pub fn new(coverage: Arc<dyn Coverage>) -> Self {
        Self {
            coverage,
            pollers: Arc::default(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Start polling `resource` unless push already covers it.
    ///
    /// Returns `None` when covered. When a live poller already exists for `resource` its handle is
    /// returned and nothing else happens.
    pub fn start_polling(
        &self,
        resource: ResourceType,
        handler: Arc<dyn PollHandler>,
        options: &PollOptions,
    ) -> Option<PollHandle> {
        if self.coverage.is_covered(&resource) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%resource, "Push covers resource, not polling");
            return None;
        }

        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        // Coverage may have been restored, and its stop already run, while we waited for the lock.
        if self.coverage.is_covered(&resource) {
            return None;
        }
        if let Some(existing) = pollers.get(&resource)
            && !existing.task.is_finished()
        {
            return Some(existing.handle.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let silent = options.silent;
        let coverage = Arc::clone(&self.coverage);
        let table = Arc::clone(&self.pollers);
        let tick_resource = resource.clone();

        let task = spawn_every(options.interval, options.jitter, move || {
            let coverage = Arc::clone(&coverage);
            let handler = Arc::clone(&handler);
            let table = Arc::clone(&table);
            let resource = tick_resource.clone();

            async move {
                if coverage.is_covered(&resource) {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(%resource, "Push coverage restored, poller stopping");
                    remove_poller(&table, &resource, id);
                    return ControlFlow::Break(());
                }

                if let Err(e) = handler.poll(&resource, silent).await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(%resource, error = %e, "Poll tick failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
                ControlFlow::Continue(())
            }
        });

        #[cfg(feature = "tracing")]
        tracing::debug!(%resource, interval = ?options.interval, "Polling started");

        let handle = PollHandle {
            resource: resource.clone(),
            id,
            token: task.token(),
        };
        pollers.insert(
            resource,
            Poller {
                handle: handle.clone(),
                task,
            },
        );

        Some(handle)
    }

    /// Stop the poller behind `handle`. No tick starts after this returns.
    pub fn stop_polling(&self, handle: &PollHandle) {
        handle.token.cancel();
        remove_poller(&self.pollers, &handle.resource, handle.id);
    }

    /// Stop whatever poller runs for `resource`. Returns whether one was running.
    pub fn stop_resource(&self, resource: &ResourceType) -> bool {
        let removed = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource);
        removed.is_some_and(|poller| {
            poller.task.cancel();
            true
        })
    }

    /// Stop the pollers of every resource push covers right now.
    pub fn stop_covered(&self) {
        let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        pollers.retain(|resource, _| !self.coverage.is_covered(resource));
    }

    pub fn stop_all(&self) {
        let drained: Vec<Poller> = self
            .pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, poller)| poller)
            .collect();
        for poller in &drained {
            poller.task.cancel();
        }
    }

    #[must_use]
    pub fn is_active(&self, resource: &ResourceType) -> bool {
        self.pollers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .is_some_and(|poller| !poller.task.is_finished())
    }

    #[must_use]
    pub fn active_resources(&self) -> Vec<ResourceType> {
        let pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut resources: Vec<ResourceType> = pollers
            .iter()
            .filter(|(_, poller)| !poller.task.is_finished())
            .map(|(resource, _)| resource.clone())
            .collect();
        resources.sort();
        resources
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn remove_poller(table: &PollerTable, resource: &ResourceType, id: u64) {
    let mut pollers = table.lock().unwrap_or_else(PoisonError::into_inner);
    if pollers
        .get(resource)
        .is_some_and(|poller| poller.handle.id == id)
    {
        pollers.remove(resource);
    }
}
