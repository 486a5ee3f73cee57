use crate::error::SourceError;
use crate::models::{signed_url_from_body, signed_url_from_value, ItemId, UpstreamBatchRequest};
use futures_util::future::{join_all, BoxFuture};
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Where signed image URLs come from.
pub trait ImageUrlSource: Send + Sync + 'static {
    /// Fetches the signed URL of one item.
    ///
    /// `Ok(None)` is a definitive answer: the item has no accessible image.
    fn fetch(&self, id: ItemId) -> BoxFuture<'_, Result<Option<String>, SourceError>>;

    /// Fetches several items at once. Ids absent from the returned map could
    /// not be resolved.
    ///
    /// Defaults to concurrent single fetches.
    fn fetch_many(
        &self,
        ids: Vec<ItemId>,
    ) -> BoxFuture<'_, Result<HashMap<ItemId, Option<String>>, SourceError>> {
        Box::pin(async move {
            let results = join_all(ids.iter().map(|&id| async move { (id, self.fetch(id).await) })).await;

            let mut values = HashMap::with_capacity(results.len());
            for (id, result) in results {
                match result {
                    Ok(value) => {
                        values.insert(id, value);
                    }
                    Err(e) => warn!(item_id = %id, error = %e, "signed url fetch failed"),
                }
            }
            Ok(values)
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpSourceOptions {
    pub timeout: Option<Duration>,
    /// Sent as `Authorization: Bearer <token>`.
    pub bearer_token: Option<String>,
    /// `name=value` pairs seeded into the cookie store for the API base.
    /// Cookies the backend sets later are sent alongside them.
    pub session_cookie: Option<String>,
}

/// The wardrobe backend's image endpoints.
#[derive(Clone)]
pub struct HttpImageSource {
    client: reqwest::Client,
    api_base: Url,
}

impl HttpImageSource {
    pub fn new(api_base: Url, options: HttpSourceOptions) -> Result<Self, SourceError> {
        let api_base = normalize_base(api_base);

        let mut headers = HeaderMap::new();
        if let Some(token) = &options.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        // A fixed Cookie header would shadow the store, so the session
        // cookie is seeded into the jar instead.
        let jar = Arc::new(Jar::default());
        if let Some(cookie) = &options.session_cookie {
            for pair in cookie.split(';').map(str::trim).filter(|pair| !pair.is_empty()) {
                jar.add_cookie_str(pair, &api_base);
            }
        }

        let mut builder = reqwest::Client::builder()
            .cookie_provider(jar)
            .default_headers(headers);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            api_base,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SourceError> {
        Ok(self.api_base.join(path)?)
    }

    async fn get_one(&self, id: ItemId) -> Result<Option<String>, SourceError> {
        let url = self.endpoint(&format!("items/{}/image/", id))?;
        debug!(item_id = %id, url = %url, "requesting signed url");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(signed_url_from_body(&body))
    }

    async fn post_batch(&self, ids: Vec<ItemId>) -> Result<HashMap<ItemId, Option<String>>, SourceError> {
        let url = self.endpoint("items/images/")?;
        debug!(count = ids.len(), url = %url, "requesting signed urls in batch");

        let request = UpstreamBatchRequest {
            item_ids: ids.iter().map(|id| id.get()).collect(),
        };
        let response = self.client.post(url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status));
        }

        let body: HashMap<String, Value> = response
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        let values = ids
            .into_iter()
            .filter_map(|id| {
                body.get(&id.to_string())
                    .map(|value| (id, signed_url_from_value(value)))
            })
            .collect();
        Ok(values)
    }
}

impl ImageUrlSource for HttpImageSource {
    fn fetch(&self, id: ItemId) -> BoxFuture<'_, Result<Option<String>, SourceError>> {
        Box::pin(self.get_one(id))
    }

    fn fetch_many(
        &self,
        ids: Vec<ItemId>,
    ) -> BoxFuture<'_, Result<HashMap<ItemId, Option<String>>, SourceError>> {
        Box::pin(self.post_batch(ids))
    }
}

/// `Url::join` drops the last segment unless the path ends with a slash.
fn normalize_base(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}
