use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use wardrobe_images::config::Config;
use wardrobe_images::routes::routes;
use wardrobe_images::{HttpImageSource, ImageLookup, ImageUrlSource, SignedUrlCache, SignedUrlResolver};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(UtcTime::rfc_3339())
        .init();

    let config = Config::from_env()?;
    let addr = config.bind_addr()?;

    let source = HttpImageSource::new(config.api_base.clone(), config.source_options())
        .context("failed to build backend client")?;
    let source: Arc<dyn ImageUrlSource> = Arc::new(source);
    let cache = SignedUrlCache::new(config.cache_size, config.cache_ttl());
    let resolver = SignedUrlResolver::new(source, cache).with_mode(config.upstream_mode());
    let lookup = ImageLookup::new(resolver);

    info!(
        api_base = %config.api_base,
        cache_ttl_secs = config.cache_ttl_secs,
        signed_url_validity_secs = config.signed_url_validity().as_secs(),
        cache_size = config.cache_size,
        upstream_mode = ?config.upstream_mode(),
        "Starting image URL cache"
    );

    let (bound, server) = warp::serve(routes(lookup, config.max_batch_size))
        .try_bind_with_graceful_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(address = %bound, "Server started");
    server.await;

    Ok(())
}
