use crate::cache::SignedUrlCache;
use crate::inflight::{InFlight, Pending};
use crate::models::ItemId;
use crate::source::ImageUrlSource;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of one resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The backend answered. `None`: the item has no image.
    Resolved(Option<String>),
    /// No answer could be obtained. Never cached.
    Failed,
}

impl Resolution {
    pub fn into_value(self) -> Option<String> {
        match self {
            Resolution::Resolved(value) => value,
            Resolution::Failed => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Resolution::Failed)
    }
}

/// How misses reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpstreamMode {
    /// One `GET /items/{id}/image/` per item.
    #[default]
    PerItem,
    /// One `POST /items/images/` per group of misses.
    Batch,
}

pub type Resolving = BoxFuture<'static, Resolution>;

/// Resolves signed URLs through the coalescer and publishes answers to the
/// cache. Never fails: upstream errors are logged and become
/// [`Resolution::Failed`].
#[derive(Clone)]
pub struct SignedUrlResolver {
    source: Arc<dyn ImageUrlSource>,
    cache: SignedUrlCache,
    in_flight: InFlight<ItemId, Resolution>,
    mode: UpstreamMode,
}

impl SignedUrlResolver {
    pub fn new(source: Arc<dyn ImageUrlSource>, cache: SignedUrlCache) -> Self {
        Self {
            source,
            cache,
            in_flight: InFlight::new(),
            mode: UpstreamMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: UpstreamMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn cache(&self) -> &SignedUrlCache {
        &self.cache
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Starts resolving `id`, or joins the resolution already running.
    ///
    /// The request is registered before this returns; the returned future
    /// only waits for the shared outcome.
    pub fn resolve(&self, id: ItemId) -> Resolving {
        let source = Arc::clone(&self.source);
        let cache = self.cache.clone();

        let pending = self.in_flight.begin(id, async move {
            // A resolution that finished between the caller's cache check and
            // our registration already did the work.
            if let Some(value) = cache.fresh(id) {
                return Resolution::Resolved(value);
            }

            match source.fetch(id).await {
                Ok(value) => {
                    debug!(item_id = %id, has_image = value.is_some(), "resolved signed url");
                    cache.put(id, value.clone());
                    Resolution::Resolved(value)
                }
                Err(e) => {
                    warn!(item_id = %id, error = %e, "signed url fetch failed");
                    Resolution::Failed
                }
            }
        });

        settle(pending)
    }

    /// Resolves a group of ids according to the configured [`UpstreamMode`].
    pub fn resolve_many(&self, ids: &[ItemId]) -> Vec<(ItemId, Resolving)> {
        match self.mode {
            UpstreamMode::PerItem => ids.iter().map(|&id| (id, self.resolve(id))).collect(),
            UpstreamMode::Batch => self.resolve_batch(ids),
        }
    }

    fn resolve_batch(&self, ids: &[ItemId]) -> Vec<(ItemId, Resolving)> {
        let source = Arc::clone(&self.source);
        let cache = self.cache.clone();

        let pending = self
            .in_flight
            .begin_batch(ids.iter().copied(), move |claimed| async move {
                let mut outcomes = HashMap::with_capacity(claimed.len());
                let mut missing = Vec::new();
                for id in claimed {
                    match cache.fresh(id) {
                        Some(value) => {
                            outcomes.insert(id, Resolution::Resolved(value));
                        }
                        None => missing.push(id),
                    }
                }
                if missing.is_empty() {
                    return outcomes;
                }

                match source.fetch_many(missing.clone()).await {
                    Ok(mut values) => {
                        for id in missing {
                            let outcome = match values.remove(&id) {
                                Some(value) => {
                                    cache.put(id, value.clone());
                                    Resolution::Resolved(value)
                                }
                                None => {
                                    warn!(item_id = %id, "item missing from batch response");
                                    Resolution::Failed
                                }
                            };
                            outcomes.insert(id, outcome);
                        }
                    }
                    Err(e) => {
                        warn!(count = missing.len(), error = %e, "batch signed url fetch failed");
                        for id in missing {
                            outcomes.insert(id, Resolution::Failed);
                        }
                    }
                }
                outcomes
            });

        pending
            .into_iter()
            .map(|(id, pending)| (id, settle(pending)))
            .collect()
    }
}

fn settle(pending: Pending<Resolution>) -> Resolving {
    pending
        .map(|outcome| outcome.unwrap_or(Resolution::Failed))
        .boxed()
}
