use serde::Serialize;
use thiserror::Error;
use tracing::error;
use warp::{http::StatusCode, reject::Reject, Rejection, Reply};

/// Failure to get an answer from the image backend.
///
/// These never reach consumers: the resolver logs them and reports "no image".
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("backend answered with status {0}")]
    Status(reqwest::StatusCode),

    #[error("undecodable response body: {0}")]
    Decode(String),

    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

#[derive(Debug)]
pub enum ApiError {
    InvalidItemId(String),
    BatchSizeExceeded(usize),
}

#[derive(Serialize)]
struct ErrorResponse {
    code: u16,
    message: String,
}

impl Reject for ApiError {}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, std::convert::Infallible> {
    let (code, message) = if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        error!("Deserialization error details: {}", e);
        (
            StatusCode::BAD_REQUEST,
            "Invalid request format. Expected {\"item_ids\": [..]}.".to_string(),
        )
    } else if let Some(e) = err.find::<ApiError>() {
        match e {
            ApiError::InvalidItemId(detail) => (
                StatusCode::BAD_REQUEST,
                format!("Invalid item id: {}", detail),
            ),
            ApiError::BatchSizeExceeded(max) => (
                StatusCode::BAD_REQUEST,
                format!("At most {} item ids can be looked up at once", max),
            ),
        }
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        (
            StatusCode::BAD_REQUEST,
            "Invalid query string".to_string(),
        )
    } else if err.is_not_found() {
        (
            StatusCode::NOT_FOUND,
            "The requested resource was not found".to_string(),
        )
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "This method is not allowed for this endpoint".to_string(),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "An internal error occurred".to_string(),
        )
    };

    let json = warp::reply::json(&ErrorResponse {
        code: code.as_u16(),
        message,
    });

    Ok(warp::reply::with_status(json, code))
}
