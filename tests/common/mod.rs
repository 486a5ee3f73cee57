#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use url::Url;
use warp::http::StatusCode;
use warp::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Reply};
use wardrobe_images::{
    HttpImageSource, HttpSourceOptions, ImageLookup, ImageUrlSource, ItemId, SignedUrlCache,
    SignedUrlResolver, UpstreamMode,
};

pub const TTL: Duration = Duration::from_secs(55);

pub fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("wardrobe_images=trace"))
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn id(raw: u64) -> ItemId {
    ItemId::new(raw).unwrap()
}

pub fn signed(raw: u64) -> String {
    format!("https://cdn.example/signed/{}?exp=1690000000", raw)
}

/// How the fake backend answers for one item.
#[derive(Debug, Clone)]
pub enum Answer {
    Url(String),
    NoImage,
    Status(u16),
    /// Sent as-is with a 200.
    Body(&'static str),
}

#[derive(Default)]
struct State {
    answers: Mutex<HashMap<u64, Answer>>,
    hits: Mutex<BTreeMap<String, usize>>,
    authorization: Mutex<Option<String>>,
    cookies: Mutex<Vec<Option<String>>>,
    set_cookie: Mutex<Option<&'static str>>,
    fail_batches: AtomicBool,
}

impl State {
    fn answer(&self, id: u64) -> Answer {
        self.answers
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Answer::Url(signed(id)))
    }

    fn single(&self, id: u64) -> Response {
        let response = self.single_body(id);
        match *self.set_cookie.lock().unwrap() {
            Some(cookie) => warp::reply::with_header(response, "set-cookie", cookie).into_response(),
            None => response,
        }
    }

    fn single_body(&self, id: u64) -> Response {
        match self.answer(id) {
            Answer::Url(url) => warp::reply::json(&json!({ "url": url })).into_response(),
            Answer::NoImage => warp::reply::json(&json!({ "url": null })).into_response(),
            Answer::Status(code) => {
                let status = StatusCode::from_u16(code).unwrap();
                warp::reply::with_status(String::new(), status).into_response()
            }
            Answer::Body(body) => body.into_response(),
        }
    }

    fn batch(&self, body: Value) -> Response {
        if self.fail_batches.load(Ordering::SeqCst) {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        let mut values = serde_json::Map::new();
        let ids = body["item_ids"].as_array().cloned().unwrap_or_default();
        for id in ids.iter().filter_map(Value::as_u64) {
            match self.answer(id) {
                Answer::Url(url) => {
                    values.insert(id.to_string(), Value::String(url));
                }
                Answer::NoImage => {
                    values.insert(id.to_string(), Value::Null);
                }
                Answer::Status(_) | Answer::Body(_) => {}
            }
        }
        warp::reply::json(&values).into_response()
    }
}

/// Fake wardrobe backend on a random port, counting every request.
///
/// Stops serving when dropped.
pub struct Backend {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: Arc<State>,
}

impl Backend {
    pub fn start() -> Self {
        let state = Arc::new(State::default());

        let counted = {
            let state = state.clone();
            warp::path::full()
                .and(warp::header::optional::<String>("authorization"))
                .and(warp::header::optional::<String>("cookie"))
                .map(move |path: FullPath, authorization: Option<String>, cookie: Option<String>| {
                    *state.hits.lock().unwrap().entry(path.as_str().to_owned()).or_default() += 1;
                    *state.authorization.lock().unwrap() = authorization;
                    state.cookies.lock().unwrap().push(cookie);
                })
                .untuple_one()
        };

        let with_state = {
            let state = state.clone();
            warp::any().map(move || state.clone())
        };

        let single = warp::get()
            .and(warp::path!("api" / "items" / u64 / "image" / ..))
            .and(with_state.clone())
            .map(|id: u64, state: Arc<State>| state.single(id));

        let batch = warp::post()
            .and(warp::path!("api" / "items" / "images" / ..))
            .and(warp::body::json())
            .and(with_state)
            .map(|body: Value, state: Arc<State>| state.batch(body));

        let (socket, future) =
            warp::serve(counted.and(single.or(batch))).bind_ephemeral(([127, 0, 0, 1], 0));
        let handle = tokio::spawn(future);

        Self {
            handle,
            socket,
            state,
        }
    }

    pub fn answer(&self, id: u64, answer: Answer) {
        self.state.answers.lock().unwrap().insert(id, answer);
    }

    pub fn fail_batches(&self) {
        self.state.fail_batches.store(true, Ordering::SeqCst);
    }

    /// Requests received since the last call.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Requests per path received since the last call.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.state.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Answers image requests with this `Set-Cookie` header.
    pub fn set_cookie(&self, cookie: &'static str) {
        *self.state.set_cookie.lock().unwrap() = Some(cookie);
    }

    /// `Cookie` header of every request so far, in arrival order.
    pub fn cookies(&self) -> Vec<Option<String>> {
        self.state.cookies.lock().unwrap().clone()
    }

    pub fn last_authorization(&self) -> Option<String> {
        self.state.authorization.lock().unwrap().clone()
    }

    pub fn api_base(&self) -> Url {
        format!("http://127.0.0.1:{}/api", self.socket.port())
            .parse()
            .unwrap()
    }

    pub fn source(&self, options: HttpSourceOptions) -> Arc<dyn ImageUrlSource> {
        Arc::new(HttpImageSource::new(self.api_base(), options).unwrap())
    }

    pub fn lookup(&self, mode: UpstreamMode) -> ImageLookup {
        let source = self.source(HttpSourceOptions::default());
        let resolver = SignedUrlResolver::new(source, SignedUrlCache::new(1_000, TTL)).with_mode(mode);
        ImageLookup::new(resolver)
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
