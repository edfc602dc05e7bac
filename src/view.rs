//! Paginated view state and the token gate that decides which responses may touch it.
//!
//! Everything here is synchronous and clock-injected; [`crate::coordinator`] owns the async
//! side (fetching, timers, publication).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::Result;
use crate::error::{Error, Kind};
use crate::types::{Entity, EntityId, Filters};
use crate::ws::types::{ENTITY_CREATED, ENTITY_DELETED, ENTITY_UPDATED, Payload};

/// Issued per fetch; only the latest one may mutate the view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestToken(u64);

impl RequestToken {
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Target of a page fetch.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageQuery {
    /// 1-based page number
    pub page: u32,
    pub per_page: u32,
    pub sort: Option<String>,
    pub filters: Filters,
}

impl PageQuery {
    #[must_use]
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.max(1),
            sort: None,
            filters: Filters::new(),
        }
    }

    #[must_use]
    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page.max(1);
        self
    }

    #[must_use]
    pub fn with_sort<S: Into<String>>(mut self, sort: Option<S>) -> Self {
        self.sort = sort.map(Into::into);
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    /// Whether both queries page through the same collection, differing at most in page number.
    #[must_use]
    pub fn same_collection(&self, other: &Self) -> bool {
        self.per_page == other.per_page && self.sort == other.sort && self.filters == other.filters
    }
}

/// One page as returned by the REST API.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub per_page: u32,
    pub total_count: u64,
    pub total_pages: u32,
}

impl<T> Page<T> {
    #[must_use]
    pub fn new(items: Vec<T>, page: u32, per_page: u32, total_count: u64) -> Self {
        let total_pages = u32::try_from(total_count.div_ceil(u64::from(per_page.max(1))))
            .unwrap_or(u32::MAX);
        Self {
            items,
            page,
            per_page,
            total_count,
            total_pages,
        }
    }
}

/// The locally held window over a server-side collection.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub struct PaginatedView<T> {
    pub page: u32,
    pub per_page: u32,
    pub total_count: u64,
    pub total_pages: u32,
    pub items: Vec<T>,
    pub filters: Filters,
    pub sort: Option<String>,
}

impl<T: Entity> PaginatedView<T> {
    fn empty(per_page: u32) -> Self {
        Self {
            page: 1,
            per_page: per_page.max(1),
            total_count: 0,
            total_pages: 0,
            items: Vec::new(),
            filters: Filters::new(),
            sort: None,
        }
    }

    #[must_use]
    pub fn query(&self) -> PageQuery {
        PageQuery::new(self.page, self.per_page)
            .with_sort(self.sort.clone())
            .with_filters(self.filters.clone())
    }

    #[must_use]
    pub fn position(&self, id: &EntityId) -> Option<usize> {
        self.items.iter().position(|item| item.id() == *id)
    }

    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.position(id).is_some()
    }

    /// On the last page (or there are no pages yet) and that page is not full.
    #[must_use]
    pub fn has_room(&self) -> bool {
        self.page >= self.total_pages
            && self.items.len() < usize::try_from(self.per_page).unwrap_or(usize::MAX)
    }
}

/// Ids of entities created by push that the view does not display, each with the instant it was
/// observed.
#[derive(Clone, Debug)]
pub struct NewEntityMarkers {
    ttl: Duration,
    entries: HashMap<EntityId, Instant>,
}

impl NewEntityMarkers {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns when the new marker expires.
    pub fn insert(&mut self, id: EntityId, now: Instant) -> Instant {
        self.entries.insert(id, now);
        now + self.ttl
    }

    pub fn remove(&mut self, id: &EntityId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Remove `id` if its marker has reached its TTL at `now`.
    pub fn expire(&mut self, id: &EntityId, now: Instant) -> bool {
        let expired = self
            .entries
            .get(id)
            .is_some_and(|created| now.saturating_duration_since(*created) >= self.ttl);
        if expired {
            self.entries.remove(id);
        }
        expired
    }

    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entries.contains_key(id)
    }

    /// Marked ids, oldest first.
    #[must_use]
    pub fn ids(&self) -> Vec<EntityId> {
        let mut entries: Vec<(&EntityId, &Instant)> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)));
        entries.into_iter().map(|(id, _)| id.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A pushed change, decoded from an envelope payload.
///
/// Created and updated payloads carry the entity under `entity`; deleted payloads carry `id`
/// (or an `entity` with an id).
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum EntityChange<T> {
    Created(T),
    Updated(T),
    Deleted(EntityId),
    /// A payload type this view does not merge.
    Other(String),
}

impl<T: Entity> EntityChange<T> {
    pub fn from_payload(payload: &Payload) -> Result<Self> {
        let entity = || -> Result<T> {
            let value = payload.get("entity").ok_or_else(|| {
                Error::protocol(format!("{} payload without entity", payload.kind))
            })?;
            T::deserialize(value).map_err(|e| Error::with_source(Kind::Protocol, e))
        };

        Ok(match payload.kind.as_str() {
            ENTITY_CREATED => Self::Created(entity()?),
            ENTITY_UPDATED => Self::Updated(entity()?),
            ENTITY_DELETED => {
                let id = match payload.get("id") {
                    Some(id) => EntityId::deserialize(id)
                        .map_err(|e| Error::with_source(Kind::Protocol, e))?,
                    None => entity()?.id(),
                };
                Self::Deleted(id)
            }
            other => Self::Other(other.to_owned()),
        })
    }
}

/// Whether a fetch is in flight for the latest token.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Fetching,
}

/// Outcome of a fetch-related operation.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The response became the view.
    Applied,
    /// A later request was issued; the response was discarded.
    Superseded,
    /// Identical change within the debounce window; nothing was fetched.
    Debounced,
    /// Page count jumped too far; a forced refetch is due instead.
    Diverged,
    /// The fetch failed for the latest token; the view is idle again.
    Failed,
    /// The view was closed.
    Released,
}

/// Outcome of a push merge.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Merge {
    Updated,
    Appended,
    /// Not displayable here; the id was marked as new, expiring at the given instant.
    Marked(EntityId, Instant),
    Removed,
    Ignored,
}

/// Point-in-time copy of a view for observers.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot<T> {
    pub view: PaginatedView<T>,
    pub phase: Phase,
    pub new_entities: Vec<EntityId>,
    pub released: bool,
}

impl<T> ViewSnapshot<T> {
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Fetching
    }
}

/// Single-writer state of one paginated view.
#[derive(Debug)]
pub struct ViewState<T> {
    view: PaginatedView<T>,
    phase: Phase,
    latest: RequestToken,
    forced: Option<RequestToken>,
    applied_total_pages: Option<u32>,
    /// Page, filters and sort behind the items currently shown.
    applied_query: Option<PageQuery>,
    last_change: Option<(PageQuery, Instant)>,
    markers: NewEntityMarkers,
    debounce: Duration,
    max_page_jump: u32,
    released: bool,
}

impl<T: Entity> ViewState<T> {
    #[must_use]
    pub fn new(per_page: u32, debounce: Duration, marker_ttl: Duration, max_page_jump: u32) -> Self {
        Self {
            view: PaginatedView::empty(per_page),
            phase: Phase::Idle,
            latest: RequestToken::default(),
            forced: None,
            applied_total_pages: None,
            applied_query: None,
            last_change: None,
            markers: NewEntityMarkers::new(marker_ttl),
            debounce,
            max_page_jump,
            released: false,
        }
    }

    #[must_use]
    pub fn view(&self) -> &PaginatedView<T> {
        &self.view
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn latest(&self) -> RequestToken {
        self.latest
    }

    #[must_use]
    pub fn markers(&self) -> &NewEntityMarkers {
        &self.markers
    }

    pub fn markers_mut(&mut self) -> &mut NewEntityMarkers {
        &mut self.markers
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    #[must_use]
    pub fn query(&self) -> PageQuery {
        self.view.query()
    }

    fn issue(&mut self) -> RequestToken {
        self.latest = self.latest.next();
        self.latest
    }

    /// Record a user-driven change of page, filters or sort.
    ///
    /// The new token becomes the latest before this returns, and the view's page, filters and sort
    /// take the target values right away. Returns `None` when released, or when `target` equals
    /// the previous change and that change is younger than the debounce window.
    pub fn request(&mut self, target: PageQuery, now: Instant) -> Option<RequestToken> {
        if self.released {
            return None;
        }

        if let Some((previous, at)) = &self.last_change
            && *previous == target
            && now.saturating_duration_since(*at) < self.debounce
        {
            return None;
        }

        let token = self.issue();
        self.forced = None;
        self.view.page = target.page;
        self.view.per_page = target.per_page;
        self.view.filters.clone_from(&target.filters);
        self.view.sort.clone_from(&target.sort);
        self.phase = Phase::Fetching;
        self.last_change = Some((target, now));

        Some(token)
    }

    /// Re-fetch the current page and filters. Never debounced; a silent refresh leaves the phase
    /// alone.
    pub fn refresh(&mut self, silent: bool) -> Option<RequestToken> {
        if self.released {
            return None;
        }

        let token = self.issue();
        self.forced = None;
        if !silent {
            self.phase = Phase::Fetching;
        }
        Some(token)
    }

    /// Issue a refetch whose response is accepted regardless of divergence.
    pub fn force_refetch(&mut self) -> RequestToken {
        let token = self.issue();
        self.forced = Some(token);
        token
    }

    /// Offer a fetched page. It is applied only if `token` is the latest one.
    pub fn apply(&mut self, token: RequestToken, page: Page<T>) -> Applied {
        if self.released {
            return Applied::Released;
        }
        if token != self.latest {
            return Applied::Superseded;
        }

        let forced = self.forced == Some(token);
        // Page counts of another filter, sort or page size are no baseline.
        let comparable = self
            .applied_query
            .as_ref()
            .is_some_and(|applied| applied.same_collection(&self.view.query()));
        if !forced
            && comparable
            && let Some(previous) = self.applied_total_pages
            && page.total_pages > previous.saturating_add(self.max_page_jump)
        {
            return Applied::Diverged;
        }

        self.view.items = page.items;
        self.view.page = page.page.max(1);
        self.view.per_page = page.per_page.max(1);
        self.view.total_count = page.total_count;
        self.view.total_pages = page.total_pages;
        self.applied_total_pages = Some(page.total_pages);
        self.applied_query = Some(self.view.query());
        self.forced = None;
        self.phase = Phase::Idle;

        Applied::Applied
    }

    /// Record a failed fetch. Returns whether it belonged to the latest token and should be
    /// reported.
    ///
    /// The optimistic page, filters and sort roll back to the ones the shown items were fetched
    /// with, and the failed change no longer debounces a retry.
    pub fn fail(&mut self, token: RequestToken) -> bool {
        if self.released || token != self.latest {
            return false;
        }
        if let Some(applied) = &self.applied_query {
            self.view.page = applied.page;
            self.view.per_page = applied.per_page;
            self.view.filters.clone_from(&applied.filters);
            self.view.sort.clone_from(&applied.sort);
        }
        self.last_change = None;
        self.forced = None;
        self.phase = Phase::Idle;
        true
    }

    /// Merge a pushed change. Never touches page, counts or the phase.
    pub fn merge(&mut self, change: EntityChange<T>, now: Instant) -> Merge {
        if self.released {
            return Merge::Ignored;
        }

        match change {
            EntityChange::Updated(entity) => self.replace(entity),
            EntityChange::Created(entity) => {
                let id = entity.id();
                if self.view.contains(&id) {
                    return self.replace(entity);
                }
                if entity.matches(&self.view.filters) && self.view.has_room() {
                    self.view.items.push(entity);
                    self.markers.remove(&id);
                    return Merge::Appended;
                }
                let expires = self.markers.insert(id.clone(), now);
                Merge::Marked(id, expires)
            }
            EntityChange::Deleted(id) => {
                let before = self.view.items.len();
                self.view.items.retain(|item| item.id() != id);
                let removed = self.view.items.len() != before;
                if self.markers.remove(&id) || removed {
                    Merge::Removed
                } else {
                    Merge::Ignored
                }
            }
            EntityChange::Other(_) => Merge::Ignored,
        }
    }

    fn replace(&mut self, entity: T) -> Merge {
        match self.view.position(&entity.id()) {
            Some(index) => {
                self.view.items[index] = entity;
                Merge::Updated
            }
            None => Merge::Ignored,
        }
    }

    /// Make every later response and merge a no-op.
    pub fn release(&mut self) {
        self.released = true;
        self.phase = Phase::Idle;
        self.markers.clear();
    }

    #[must_use]
    pub fn snapshot(&self) -> ViewSnapshot<T> {
        ViewSnapshot {
            view: self.view.clone(),
            phase: self.phase,
            new_entities: self.markers.ids(),
            released: self.released,
        }
    }
}
