use crate::resolver::UpstreamMode;
use crate::source::HttpSourceOptions;
use anyhow::{ensure, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

#[derive(Parser, Clone, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, env = "PORT", default_value = "8070")]
    pub port: u16,

    /// Base URL of the wardrobe backend API.
    #[arg(long, env = "API_BASE", default_value = "http://127.0.0.1:8000/api")]
    pub api_base: Url,

    /// How long a signed URL is reused. Must stay below the signing validity.
    #[arg(long, env = "CACHE_TTL_SECS", default_value = "55")]
    pub cache_ttl_secs: u64,

    /// Validity the backend signs image URLs with.
    #[arg(long, env = "SIGNED_URL_VALIDITY_SECS", default_value = "3600")]
    pub signed_url_validity_secs: u64,

    #[arg(long, env = "CACHE_SIZE", default_value = "10000")]
    pub cache_size: u64,

    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "10")]
    pub request_timeout_secs: u64,

    /// Resolve misses through `POST /items/images/` instead of one request per item.
    #[arg(long, env = "UPSTREAM_BATCH")]
    pub upstream_batch: bool,

    #[arg(long, env = "MAX_BATCH_SIZE", default_value = "200")]
    pub max_batch_size: usize,

    #[arg(long, env = "BEARER_TOKEN", hide_env_values = true)]
    pub bearer_token: Option<String>,

    #[arg(long, env = "SESSION_COOKIE", hide_env_values = true)]
    pub session_cookie: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Rejects a TTL that could serve a URL past its real expiry.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.cache_ttl_secs > 0, "cache TTL must be positive");
        ensure!(
            self.cache_ttl_secs < self.signed_url_validity_secs,
            "cache TTL ({}s) must be shorter than the signed URL validity ({}s)",
            self.cache_ttl_secs,
            self.signed_url_validity_secs
        );
        ensure!(self.max_batch_size > 0, "max batch size must be positive");
        ensure!(self.cache_size > 0, "cache size must be positive");
        ensure!(self.request_timeout_secs > 0, "request timeout must be positive");
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn signed_url_validity(&self) -> Duration {
        Duration::from_secs(self.signed_url_validity_secs)
    }

    pub fn upstream_mode(&self) -> UpstreamMode {
        if self.upstream_batch {
            UpstreamMode::Batch
        } else {
            UpstreamMode::PerItem
        }
    }

    pub fn source_options(&self) -> HttpSourceOptions {
        HttpSourceOptions {
            timeout: Some(Duration::from_secs(self.request_timeout_secs)),
            bearer_token: self.bearer_token.clone(),
            session_cookie: self.session_cookie.clone(),
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
