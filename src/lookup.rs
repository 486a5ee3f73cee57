//! Lookups for UI consumers.
//!
//! A lookup answers from the cache immediately and resolves the rest in the
//! background, publishing a new [`BatchSnapshot`] every time an item settles.

use crate::cache::Lookup;
use crate::models::ItemId;
use crate::resolver::{Resolution, Resolving, SignedUrlResolver};
use futures_util::future::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use tokio::sync::watch;
use tracing::debug;

/// Where one item of a lookup stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageState {
    Absent,
    Pending,
    Resolved(Option<String>),
    Failed,
}

impl ImageState {
    pub fn value(&self) -> Option<&str> {
        match self {
            ImageState::Resolved(Some(url)) => Some(url),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ImageState::Pending)
    }
}

impl From<Resolution> for ImageState {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Resolved(value) => ImageState::Resolved(value),
            Resolution::Failed => ImageState::Failed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSnapshot {
    states: BTreeMap<ItemId, ImageState>,
}

impl BatchSnapshot {
    /// True while any item of the batch is still being resolved.
    pub fn loading(&self) -> bool {
        self.states.values().any(ImageState::is_pending)
    }

    pub fn state(&self, id: ItemId) -> ImageState {
        self.states.get(&id).cloned().unwrap_or(ImageState::Absent)
    }

    pub fn value(&self, id: ItemId) -> Option<&str> {
        self.states.get(&id).and_then(ImageState::value)
    }

    pub fn states(&self) -> &BTreeMap<ItemId, ImageState> {
        &self.states
    }

    /// Every requested id; pending and failed items map to `None`.
    pub fn values(&self) -> BTreeMap<ItemId, Option<String>> {
        self.states
            .iter()
            .map(|(id, state)| (*id, state.value().map(str::to_owned)))
            .collect()
    }
}

/// Handle on a running batch lookup.
///
/// Dropping it only stops the updates: resolutions already started still
/// complete and land in the cache.
pub struct BatchLookup {
    ids: Vec<ItemId>,
    snapshot: watch::Receiver<BatchSnapshot>,
}

impl BatchLookup {
    pub fn ids(&self) -> &[ItemId] {
        &self.ids
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn loading(&self) -> bool {
        self.snapshot.borrow().loading()
    }

    pub fn values(&self) -> BTreeMap<ItemId, Option<String>> {
        self.snapshot.borrow().values()
    }

    /// Waits for the next update. `None` once nothing is left to settle.
    pub async fn changed(&mut self) -> Option<BatchSnapshot> {
        match self.snapshot.changed().await {
            Ok(()) => Some(self.snapshot.borrow_and_update().clone()),
            Err(_) => None,
        }
    }

    /// Waits until no item is pending any more.
    pub async fn settled(mut self) -> BatchSnapshot {
        if let Ok(snapshot) = self.snapshot.wait_for(|snapshot| !snapshot.loading()).await {
            return snapshot.clone();
        }
        self.snapshot.borrow().clone()
    }
}

/// Handle on a lookup of zero or one item.
pub struct SingleLookup {
    id: Option<ItemId>,
    batch: Option<BatchLookup>,
}

impl SingleLookup {
    pub fn id(&self) -> Option<ItemId> {
        self.id
    }

    pub fn state(&self) -> ImageState {
        match (&self.batch, self.id) {
            (Some(batch), Some(id)) => batch.snapshot.borrow().state(id),
            _ => ImageState::Absent,
        }
    }

    pub fn value(&self) -> Option<String> {
        self.state().value().map(str::to_owned)
    }

    pub fn loading(&self) -> bool {
        self.batch.as_ref().map_or(false, BatchLookup::loading)
    }

    pub async fn settled(self) -> Option<String> {
        let (batch, id) = match (self.batch, self.id) {
            (Some(batch), Some(id)) => (batch, id),
            _ => return None,
        };
        batch.settled().await.value(id).map(str::to_owned)
    }
}

/// Entry point for consumers: cached signed URLs for sets of items.
#[derive(Clone)]
pub struct ImageLookup {
    resolver: SignedUrlResolver,
}

impl ImageLookup {
    pub fn new(resolver: SignedUrlResolver) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &SignedUrlResolver {
        &self.resolver
    }

    /// Starts a lookup of `ids`.
    ///
    /// Valid cache entries are in the first snapshot; absent or expired ones
    /// are pending and resolved in the background. Must be called from
    /// within a tokio runtime when anything needs resolving.
    pub fn lookup<I>(&self, ids: I) -> BatchLookup
    where
        I: IntoIterator<Item = ItemId>,
    {
        let mut requested = Vec::new();
        let mut states = BTreeMap::new();
        let mut misses = Vec::new();

        for id in ids {
            if states.contains_key(&id) {
                continue;
            }
            requested.push(id);
            match self.resolver.cache().lookup(id) {
                Lookup::Fresh(value) => {
                    states.insert(id, ImageState::Resolved(value));
                }
                Lookup::Stale(_) | Lookup::Absent => {
                    states.insert(id, ImageState::Pending);
                    misses.push(id);
                }
            }
        }

        let (sender, receiver) = watch::channel(BatchSnapshot { states });

        if !misses.is_empty() {
            debug!(
                hits = requested.len() - misses.len(),
                misses = misses.len(),
                "resolving signed urls"
            );
            let resolving = self.resolver.resolve_many(&misses);
            tokio::spawn(deliver(resolving, sender));
        }

        BatchLookup {
            ids: requested,
            snapshot: receiver,
        }
    }

    /// Lookup for call sites showing a single item, or none yet.
    pub fn lookup_one(&self, id: Option<ItemId>) -> SingleLookup {
        SingleLookup {
            id,
            batch: id.map(|id| self.lookup([id])),
        }
    }

    /// The signed URL of `id`, waiting for resolution if needed.
    pub async fn signed_url(&self, id: ItemId) -> Option<String> {
        self.lookup_one(Some(id)).settled().await
    }

    pub fn cached_entries(&self) -> u64 {
        self.resolver.cache().len()
    }

    pub fn in_flight(&self) -> usize {
        self.resolver.in_flight()
    }
}

/// Publishes each settled item to the lookup's watchers.
async fn deliver(resolving: Vec<(ItemId, Resolving)>, sender: watch::Sender<BatchSnapshot>) {
    let mut settling: FuturesUnordered<_> = resolving
        .into_iter()
        .map(|(id, resolving)| resolving.map(move |resolution| (id, resolution)))
        .collect();

    while let Some((id, resolution)) = settling.next().await {
        if sender.is_closed() {
            debug!("lookup dropped before settling");
            return;
        }
        sender.send_modify(|snapshot| {
            snapshot.states.insert(id, resolution.into());
        });
    }
}
