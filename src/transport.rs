use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use tokio::sync::Semaphore;

use crate::cachecontrol::update_cache_headers;
use crate::fetch::{FetchError, RemoteRequest, RemoteResponse, Transport};
use crate::httpcache::CachedTransport;
use crate::options::Options;
use crate::should304;
use crate::transform;

/// A transport that transforms images according to the options encoded in
/// the request URL fragment.
///
/// Requests without a fragment are plain fetches and pass through to the
/// wire transport, picking up the shared-cache header rewrite on the way
/// back. Requests with a fragment fetch the original through the caching
/// client (so the original is cached under its own bare-URL key and shared
/// between variants), then transform the body and synthesize a response for
/// the cache layer above to store under the fragmented key.
pub struct TransformingTransport {
    wire: Arc<dyn Transport>,
    caching_client: OnceLock<Arc<CachedTransport>>,

    /// Limits the number of concurrent transformations.
    limiter: Semaphore,

    force_cache: bool,
    minimum_cache_duration: Duration,
}

impl TransformingTransport {
    pub fn new(
        wire: Arc<dyn Transport>,
        force_cache: bool,
        minimum_cache_duration: Duration,
    ) -> Self {
        let parallelism = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        TransformingTransport {
            wire,
            caching_client: OnceLock::new(),
            limiter: Semaphore::new(parallelism),
            force_cache,
            minimum_cache_duration,
        }
    }

    /// Closes the loop with the caching client sitting above this transport.
    /// Must be called once before the first transform request.
    pub fn set_caching_client(&self, client: Arc<CachedTransport>) {
        let _ = self.caching_client.set(client);
    }

    fn caching_client(&self) -> Result<&Arc<CachedTransport>, FetchError> {
        self.caching_client
            .get()
            .ok_or_else(|| FetchError::Internal("caching client not wired".to_string()))
    }
}

#[async_trait]
impl Transport for TransformingTransport {
    async fn round_trip(&self, req: &RemoteRequest) -> Result<RemoteResponse, FetchError> {
        let fragment = match req.url.fragment() {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => {
                // normal requests pass through
                tracing::debug!(url = %req.url, "fetching remote URL");
                let mut resp = self.wire.round_trip(req).await?;
                update_cache_headers(
                    &mut resp.headers,
                    self.force_cache,
                    self.minimum_cache_duration,
                );
                return Ok(resp);
            }
        };

        let mut bare = req.clone();
        bare.url.set_fragment(None);
        let resp = self.caching_client()?.round_trip(&bare).await?;

        if should304(&req.headers, &resp) {
            // bare 304 response, the full response will be replayed from cache
            return Ok(RemoteResponse::new(StatusCode::NOT_MODIFIED));
        }

        // acquire a transform slot only after the 304 fast path, so
        // conditional traffic is never blocked behind transformation load
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| FetchError::Internal("transform limiter closed".to_string()))?;

        let options = Options::parse(&fragment);
        let body = match transform::transform(&resp.body, &options) {
            Ok(transformed) => Bytes::from(transformed),
            Err(err) => {
                tracing::error!(url = %req.url, error = %err, "error transforming image");
                resp.body.clone()
            }
        };

        // replay the response with the transformed body and corrected
        // headers: Content-Length always changes, and Content-Type is
        // dropped when the output format may differ from the original
        let mut headers = resp.headers.clone();
        headers.remove(CONTENT_LENGTH);
        let content_type = resp.header_str(CONTENT_TYPE).unwrap_or_default();
        if !options.format.is_empty()
            || content_type == "image/webp"
            || content_type == "image/tiff"
        {
            headers.remove(CONTENT_TYPE);
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        Ok(RemoteResponse { status: resp.status, headers, body })
    }
}

/// Builds the client stack: wire transport at the bottom, the transforming
/// transport above it, and the caching transport on top, with the transform
/// branch looped back through the caching layer.
pub fn build_client(
    wire: Arc<dyn Transport>,
    cache: Arc<dyn crate::cache::Cache>,
    force_cache: bool,
    minimum_cache_duration: Duration,
    time_now: Option<chrono::DateTime<chrono::Utc>>,
) -> Arc<CachedTransport> {
    let transforming = Arc::new(TransformingTransport::new(
        wire,
        force_cache,
        minimum_cache_duration,
    ));
    let client = Arc::new(CachedTransport::new(cache, transforming.clone(), time_now));
    transforming.set_caching_client(client.clone());
    client
}
