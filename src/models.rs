use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Identifier of an item whose image is resolved. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ItemId(u64);

impl ItemId {
    pub fn new(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidItemId {
    #[error("item id must be positive")]
    Zero,
    #[error("item id is not an integer: {0}")]
    NotANumber(#[from] ParseIntError),
}

impl TryFrom<u64> for ItemId {
    type Error = InvalidItemId;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::new(raw).ok_or(InvalidItemId::Zero)
    }
}

impl From<ItemId> for u64 {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

impl FromStr for ItemId {
    type Err = InvalidItemId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: u64 = s.trim().parse()?;
        Self::try_from(raw)
    }
}

/// Extracts the signed URL from an image endpoint body.
///
/// The backend answers `{"url": "..."}` or `{"url": null}`. Anything other
/// than a string under `url` means the item has no accessible image.
pub fn signed_url_from_body(body: &Value) -> Option<String> {
    body.get("url").and_then(signed_url_from_value)
}

/// Same as [`signed_url_from_body`] for a bare value, as found in the
/// batch endpoint's `{"<id>": "..."}` map.
pub fn signed_url_from_value(value: &Value) -> Option<String> {
    value.as_str().map(str::to_owned)
}

/// Body of the backend's `POST /items/images/`.
#[derive(Debug, Serialize)]
pub struct UpstreamBatchRequest {
    pub item_ids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BatchImageRequest {
    pub item_ids: Vec<u64>,
}

impl BatchImageRequest {
    /// Validated, deduplicated ids in request order.
    pub fn item_ids(&self) -> Result<Vec<ItemId>, InvalidItemId> {
        let mut seen = HashSet::with_capacity(self.item_ids.len());
        let mut ids = Vec::with_capacity(self.item_ids.len());
        for raw in &self.item_ids {
            let id = ItemId::try_from(*raw)?;
            if seen.insert(id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct SingleImageResponse {
    pub value: Option<String>,
    pub loading: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct BatchImageResponse {
    pub values: BTreeMap<ItemId, Option<String>>,
    pub loading: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub cached_entries: u64,
    pub in_flight: usize,
}
