use crate::error::handle_rejection;
use crate::handlers;
use crate::lookup::ImageLookup;
use crate::middleware::{add_request_id_header, with_request_id};
use crate::models::WaitQuery;
use std::convert::Infallible;
use warp::{Filter, Reply};

const MAX_BODY_BYTES: u64 = 64 * 1024;

/// All endpoints of the sidecar, rejections already turned into replies.
pub fn routes(
    lookup: ImageLookup,
    max_batch_size: usize,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let lookup = warp::any().map(move || lookup.clone());

    let single = warp::path!("images" / String)
        .and(warp::get())
        .and(warp::query::<WaitQuery>())
        .and(lookup.clone())
        .and_then(handlers::get_image_handler);

    let batch = warp::path!("images")
        .and(warp::post())
        .and(warp::query::<WaitQuery>())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(lookup.clone())
        .and(warp::any().map(move || max_batch_size))
        .and_then(handlers::batch_images_handler);

    let stats = warp::path!("stats")
        .and(warp::get())
        .and(lookup)
        .and_then(handlers::stats_handler);

    let api = single.or(batch).or(stats).recover(handle_rejection);

    with_request_id().and(api).map(add_request_id_header)
}
