use crate::error::ApiError;
use crate::lookup::ImageLookup;
use crate::models::{
    BatchImageRequest, BatchImageResponse, InvalidItemId, ItemId, SingleImageResponse,
    StatsResponse, WaitQuery,
};
use tracing::info;
use warp::{Rejection, Reply};

pub async fn get_image_handler(
    raw_id: String,
    query: WaitQuery,
    lookup: ImageLookup,
) -> Result<impl Reply, Rejection> {
    let id: ItemId = raw_id
        .parse()
        .map_err(|e: InvalidItemId| warp::reject::custom(ApiError::InvalidItemId(e.to_string())))?;

    let single = lookup.lookup_one(Some(id));
    let response = if query.wait {
        SingleImageResponse {
            value: single.settled().await,
            loading: false,
        }
    } else {
        SingleImageResponse {
            value: single.value(),
            loading: single.loading(),
        }
    };

    Ok(warp::reply::json(&response))
}

pub async fn batch_images_handler(
    query: WaitQuery,
    body: BatchImageRequest,
    lookup: ImageLookup,
    max_batch_size: usize,
) -> Result<impl Reply, Rejection> {
    let ids = body
        .item_ids()
        .map_err(|e| warp::reject::custom(ApiError::InvalidItemId(e.to_string())))?;
    if ids.len() > max_batch_size {
        return Err(warp::reject::custom(ApiError::BatchSizeExceeded(
            max_batch_size,
        )));
    }

    let batch = lookup.lookup(ids);
    let snapshot = if query.wait {
        batch.settled().await
    } else {
        batch.snapshot()
    };

    info!(
        requested = snapshot.states().len(),
        loading = snapshot.loading(),
        "Answered batch image lookup"
    );
    Ok(warp::reply::json(&BatchImageResponse {
        values: snapshot.values(),
        loading: snapshot.loading(),
    }))
}

pub async fn stats_handler(lookup: ImageLookup) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&StatsResponse {
        cached_entries: lookup.cached_entries(),
        in_flight: lookup.in_flight(),
    }))
}
