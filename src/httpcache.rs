use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http::header::{
    HeaderName, HeaderValue, DATE, ETAG, EXPIRES, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
};
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::cachecontrol::{parse_http_date, CacheControl};
use crate::fetch::{FetchError, RemoteRequest, RemoteResponse, Transport};

/// Marker header added to responses replayed from the cache.
pub const X_FROM_CACHE: &str = "x-from-cache";

/// A shared-cache transport. Successful responses are stored under their
/// full request URL (fragment included, which is how transformed variants
/// live alongside originals), served while fresh, and revalidated with
/// conditional requests once stale. Replayed responses carry an
/// `X-From-Cache: 1` marker.
pub struct CachedTransport {
    cache: Arc<dyn Cache>,
    inner: Arc<dyn Transport>,
    time_now: Option<DateTime<Utc>>,
}

impl CachedTransport {
    pub fn new(
        cache: Arc<dyn Cache>,
        inner: Arc<dyn Transport>,
        time_now: Option<DateTime<Utc>>,
    ) -> Self {
        CachedTransport { cache, inner, time_now }
    }

    fn now(&self) -> DateTime<Utc> {
        self.time_now.unwrap_or_else(Utc::now)
    }

    async fn store(&self, key: &str, resp: &RemoteResponse) {
        if !storable(resp) {
            return;
        }
        self.cache.set(key, &encode_entry(resp)).await;
    }
}

#[async_trait]
impl Transport for CachedTransport {
    async fn round_trip(&self, req: &RemoteRequest) -> Result<RemoteResponse, FetchError> {
        let key = req.url.as_str().to_string();

        let stored = match self.cache.get(&key).await {
            Some(raw) => decode_entry(&raw),
            None => None,
        };

        let Some(stored) = stored else {
            let resp = self.inner.round_trip(req).await?;
            self.store(&key, &resp).await;
            return Ok(resp);
        };

        if is_fresh(&stored.headers, self.now()) {
            return Ok(mark_cached(stored));
        }

        // stale entry, revalidate downstream with its validators
        let mut revalidation = req.clone();
        if let Some(etag) = stored.headers.get(ETAG) {
            revalidation.headers.insert(IF_NONE_MATCH, etag.clone());
        }
        if let Some(last_modified) = stored.headers.get(LAST_MODIFIED) {
            revalidation.headers.insert(IF_MODIFIED_SINCE, last_modified.clone());
        }

        let resp = self.inner.round_trip(&revalidation).await?;
        if resp.status == StatusCode::NOT_MODIFIED {
            // refresh the stored entry's end-to-end headers and replay it
            let mut refreshed = stored;
            for (name, value) in resp.headers.iter() {
                refreshed.headers.insert(name.clone(), value.clone());
            }
            self.cache.set(&key, &encode_entry(&refreshed)).await;
            return Ok(mark_cached(refreshed));
        }

        self.store(&key, &resp).await;
        Ok(resp)
    }
}

fn mark_cached(mut resp: RemoteResponse) -> RemoteResponse {
    resp.headers
        .insert(HeaderName::from_static(X_FROM_CACHE), HeaderValue::from_static("1"));
    resp
}

/// Whether a response may be stored by a shared cache. The rewriter has
/// already promoted `private` to `no-store` before this check runs.
fn storable(resp: &RemoteResponse) -> bool {
    if resp.status != StatusCode::OK {
        return false;
    }
    !CacheControl::from_headers(&resp.headers).contains("no-store")
}

/// Whether a stored response is still fresh at `now`, per its Date and
/// max-age (falling back to Expires).
fn is_fresh(headers: &HeaderMap, now: DateTime<Utc>) -> bool {
    let cc = CacheControl::from_headers(headers);
    if cc.contains("no-store") || cc.contains("no-cache") {
        return false;
    }

    let date = headers
        .get(DATE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date);

    if let Some(max_age) = cc.get("max-age").and_then(|v| v.parse::<i64>().ok()) {
        let Some(date) = date else { return false };
        return now.signed_duration_since(date) < TimeDelta::seconds(max_age);
    }

    if let Some(expires) = headers
        .get(EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
    {
        return now < expires;
    }

    false
}

#[derive(Serialize, Deserialize)]
struct StoredResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

fn encode_entry(resp: &RemoteResponse) -> Vec<u8> {
    let entry = StoredResponse {
        status: resp.status.as_u16(),
        headers: resp
            .headers
            .iter()
            .map(|(name, value)| {
                (name.as_str().to_string(), String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .collect(),
        body: STANDARD.encode(&resp.body),
    };
    serde_json::to_vec(&entry).unwrap_or_default()
}

/// Decodes a stored entry; a corrupt entry reads as a cache miss.
fn decode_entry(raw: &[u8]) -> Option<RemoteResponse> {
    let entry: StoredResponse = match serde_json::from_slice(raw) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::warn!(error = %err, "discarding corrupt cache entry");
            return None;
        }
    };

    let status = StatusCode::from_u16(entry.status).ok()?;
    let mut headers = HeaderMap::new();
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value))
        {
            headers.append(name, value);
        }
    }
    let body = Bytes::from(STANDARD.decode(&entry.body).ok()?);

    Some(RemoteResponse { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::cachecontrol::format_http_date;
    use crate::fetch::testing::ScriptedTransport;
    use url::Url;

    fn image_response(body: &str, extra: &[(&str, &str)]) -> RemoteResponse {
        let mut resp = RemoteResponse::new(StatusCode::OK);
        resp.body = Bytes::from(body.to_string());
        resp.headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg"));
        for (name, value) in extra {
            resp.headers.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        resp
    }

    fn cacheable(body: &str) -> RemoteResponse {
        image_response(
            body,
            &[
                ("date", &format_http_date(Utc::now())),
                ("cache-control", "max-age=3600"),
            ],
        )
    }

    fn request(url: &str) -> RemoteRequest {
        RemoteRequest::new(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let inner = Arc::new(ScriptedTransport::new(vec![Ok(cacheable("payload"))]));
        let transport = CachedTransport::new(
            Arc::new(InMemoryCache::new(1 << 20)),
            inner.clone(),
            None,
        );

        let req = request("http://example.com/a.jpg#0x0");
        let first = transport.round_trip(&req).await.unwrap();
        assert_eq!(first.body, Bytes::from("payload"));
        assert!(first.headers.get(X_FROM_CACHE).is_none());

        let second = transport.round_trip(&req).await.unwrap();
        assert_eq!(second.body, Bytes::from("payload"));
        assert_eq!(second.header_str(X_FROM_CACHE), Some("1"));
        assert_eq!(inner.call_count(), 1);
    }

    #[tokio::test]
    async fn fragment_is_part_of_the_key() {
        let inner = Arc::new(ScriptedTransport::new(vec![
            Ok(cacheable("original")),
            Ok(cacheable("variant")),
        ]));
        let transport =
            CachedTransport::new(Arc::new(InMemoryCache::new(1 << 20)), inner.clone(), None);

        let original = transport
            .round_trip(&request("http://example.com/a.jpg"))
            .await
            .unwrap();
        let variant = transport
            .round_trip(&request("http://example.com/a.jpg#100x100"))
            .await
            .unwrap();
        assert_eq!(original.body, Bytes::from("original"));
        assert_eq!(variant.body, Bytes::from("variant"));
        assert_eq!(inner.call_count(), 2);
    }

    #[tokio::test]
    async fn stale_entry_revalidated_with_304() {
        let stale = image_response(
            "payload",
            &[("etag", "\"v1\""), ("cache-control", "max-age=0"), ("date", "Mon, 02 Jan 2006 15:04:05 GMT")],
        );

        let mut not_modified = RemoteResponse::new(StatusCode::NOT_MODIFIED);
        not_modified
            .headers
            .insert(http::header::CACHE_CONTROL, HeaderValue::from_static("max-age=60"));

        let inner = Arc::new(ScriptedTransport::new(vec![Ok(stale), Ok(not_modified)]));
        let transport =
            CachedTransport::new(Arc::new(InMemoryCache::new(1 << 20)), inner.clone(), None);

        let req = request("http://example.com/a.jpg");
        let first = transport.round_trip(&req).await.unwrap();
        assert_eq!(first.body, Bytes::from("payload"));

        // stale now; the 304 refresh replays the stored body
        let second = transport.round_trip(&req).await.unwrap();
        assert_eq!(second.status, StatusCode::OK);
        assert_eq!(second.body, Bytes::from("payload"));
        assert_eq!(second.header_str(X_FROM_CACHE), Some("1"));
        assert_eq!(second.header_str(http::header::CACHE_CONTROL), Some("max-age=60"));
        assert_eq!(inner.call_count(), 2);
    }

    #[tokio::test]
    async fn no_store_responses_are_not_cached() {
        let response = image_response("secret", &[("cache-control", "no-store")]);
        let inner = Arc::new(ScriptedTransport::new(vec![
            Ok(response.clone()),
            Ok(response),
        ]));
        let transport =
            CachedTransport::new(Arc::new(InMemoryCache::new(1 << 20)), inner.clone(), None);

        let req = request("http://example.com/a.jpg");
        transport.round_trip(&req).await.unwrap();
        transport.round_trip(&req).await.unwrap();
        assert_eq!(inner.call_count(), 2);
    }

    #[tokio::test]
    async fn non_200_responses_are_not_cached() {
        let inner = Arc::new(ScriptedTransport::new(vec![
            Ok(crate::fetch::testing::response(404)),
            Ok(crate::fetch::testing::response(404)),
        ]));
        let transport =
            CachedTransport::new(Arc::new(InMemoryCache::new(1 << 20)), inner.clone(), None);

        let req = request("http://example.com/missing.jpg");
        transport.round_trip(&req).await.unwrap();
        transport.round_trip(&req).await.unwrap();
        assert_eq!(inner.call_count(), 2);
    }

    #[test]
    fn entry_codec_round_trip() {
        let resp = image_response("bytes \u{1F408}", &[("etag", "\"tag\"")]);
        let decoded = decode_entry(&encode_entry(&resp)).unwrap();
        assert_eq!(decoded.status, resp.status);
        assert_eq!(decoded.body, resp.body);
        assert_eq!(decoded.header_str(ETAG), Some("\"tag\""));
    }

    #[test]
    fn corrupt_entry_reads_as_miss() {
        assert!(decode_entry(b"not json").is_none());
    }
}
