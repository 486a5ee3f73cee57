use std::convert::Infallible;
use tracing::info;
use uuid::Uuid;
use warp::http::Method;
use warp::path::FullPath;
use warp::{Filter, Reply};

pub fn with_request_id() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::method()
        .and(warp::path::full())
        .map(|method: Method, path: FullPath| {
            let request_id = Uuid::new_v4().to_string();
            info!(request_id = %request_id, method = %method, path = path.as_str(), "Processing request");
            request_id
        })
}

pub fn add_request_id_header<T: Reply>(request_id: String, reply: T) -> impl Reply {
    warp::reply::with_header(reply, "X-Request-ID", request_id)
}
