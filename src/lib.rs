//! imagegate is a caching image proxy server. Requests name a remote image
//! and a set of transformation options in the URL path; the proxy fetches
//! the image (through a shared HTTP cache), applies the transformations,
//! and serves the result.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode, Uri};
use thiserror::Error;

pub mod auth;
pub mod cache;
pub mod cachecontrol;
pub mod config;
pub mod fetch;
pub mod httpcache;
pub mod metrics;
pub mod options;
pub mod request;
pub mod transform;
pub mod transport;

pub use crate::config::ProxyConfig;
pub use crate::options::Options;
pub use crate::request::ImageRequest;

use crate::cache::Cache;
use crate::cachecontrol::parse_http_date;
use crate::fetch::{FetchError, RemoteRequest, RemoteResponse, Transport, WireTransport};
use crate::httpcache::CachedTransport;

const MSG_NOT_ALLOWED: &str = "requested URL is not allowed";
const MSG_NOT_ALLOWED_IN_REDIRECT: &str = "requested URL in redirect is not allowed";
const MSG_GATEWAY_TIMEOUT: &str = "Gateway timeout waiting for remote resource.";

/// Headers passed from the upstream response to the client when no explicit
/// allowlist is configured.
const DEFAULT_PASS_RESPONSE_HEADERS: [&str; 5] =
    ["Cache-Control", "Last-Modified", "Expires", "Etag", "Link"];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid request URL: {0}")]
    InvalidRequest(#[from] request::UrlError),
    #[error("{0}")]
    NotAllowed(auth::AuthError),
    #[error("requested URL in redirect is not allowed")]
    NotAllowedInRedirect,
    #[error("not found")]
    NotFound,
    #[error("error fetching remote image: {0}")]
    Remote(FetchError),
    #[error("content-type not allowed: {0:?}")]
    ContentType(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match &self {
            ProxyError::InvalidRequest(err) => {
                tracing::warn!(error = %err, "invalid request URL");
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            ProxyError::NotAllowed(err) => {
                tracing::warn!(error = %err, "request not allowed");
                (StatusCode::FORBIDDEN, MSG_NOT_ALLOWED).into_response()
            }
            ProxyError::NotAllowedInRedirect => {
                (StatusCode::FORBIDDEN, MSG_NOT_ALLOWED_IN_REDIRECT).into_response()
            }
            ProxyError::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
            ProxyError::Remote(err) => {
                tracing::error!(error = %err, "error fetching remote image");
                metrics::REMOTE_ERRORS.inc();
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
            ProxyError::ContentType(content_type) => {
                tracing::warn!(content_type = %content_type, "content-type not allowed");
                (StatusCode::FORBIDDEN, MSG_NOT_ALLOWED).into_response()
            }
        }
    }
}

/// The image proxy: configuration plus the caching client stack used to
/// fetch and transform remote images.
pub struct Proxy {
    config: ProxyConfig,
    client: Arc<CachedTransport>,
}

impl Proxy {
    /// Constructs a proxy that fetches remote images over the network.
    pub fn new(config: ProxyConfig, cache: Arc<dyn Cache>) -> Result<Proxy, FetchError> {
        let wire = Arc::new(WireTransport::new(&config)?);
        Ok(Proxy::with_transport(config, cache, wire))
    }

    /// Constructs a proxy over the provided wire transport. Used by tests to
    /// substitute a scripted upstream.
    pub fn with_transport(
        config: ProxyConfig,
        cache: Arc<dyn Cache>,
        wire: Arc<dyn Transport>,
    ) -> Proxy {
        let client = transport::build_client(
            wire,
            cache,
            config.force_cache,
            config.minimum_cache_duration,
            config.time_now,
        );
        Proxy { config, client }
    }

    async fn serve(&self, uri: &Uri, headers: &HeaderMap) -> Result<Response, ProxyError> {
        let path = uri.path().strip_prefix('/').unwrap_or_else(|| uri.path());
        let mut req =
            ImageRequest::parse(path, uri.query(), self.config.default_base_url.as_ref())?;

        let referer = headers.get(header::REFERER).and_then(|v| v.to_str().ok());
        auth::allowed(&req, referer, &self.config).map_err(ProxyError::NotAllowed)?;

        // static proxy settings override per-request options
        req.options.scale_up = self.config.scale_up;

        let mut remote = RemoteRequest::new(req.canonical_url());
        if let Some(user_agent) = &self.config.user_agent {
            if let Ok(value) = HeaderValue::from_str(user_agent) {
                remote.headers.insert(header::USER_AGENT, value);
            }
        }
        if !self.config.content_types.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.config.content_types.join(", ")) {
                remote.headers.insert(header::ACCEPT, value);
            }
        }
        if self.config.include_referer {
            // pass along the referer header from the original request
            copy_header(&mut remote.headers, headers, &["referer"]);
        }
        copy_header(&mut remote.headers, headers, &self.config.pass_request_headers);

        let resp = fetch::do_with_retries(self.client.as_ref(), &remote).await.map_err(|err| {
            match err {
                FetchError::RedirectDenied => ProxyError::NotAllowedInRedirect,
                err => ProxyError::Remote(err),
            }
        })?;

        // return early on 404s
        if resp.status == StatusCode::NOT_FOUND {
            return Err(ProxyError::NotFound);
        }

        let cached = resp.header_str(httpcache::X_FROM_CACHE) == Some("1");
        if self.config.verbose {
            tracing::debug!(url = %remote.url, from_cache = cached, "serving remote response");
        }
        if cached {
            metrics::SERVED_FROM_CACHE.inc();
        }

        let mut response_headers = HeaderMap::new();
        match &self.config.pass_response_headers {
            None => copy_header(
                &mut response_headers,
                &resp.headers,
                &DEFAULT_PASS_RESPONSE_HEADERS,
            ),
            Some(names) => copy_header(&mut response_headers, &resp.headers, names),
        }

        if should304(headers, &resp) {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            *response.headers_mut() = response_headers;
            return Ok(response);
        }

        let mut content_type = resp
            .header_str(header::CONTENT_TYPE)
            .and_then(|v| v.parse::<mime::Mime>().ok())
            .map(|m| m.essence_str().to_string())
            .unwrap_or_default();
        if content_type.is_empty()
            || content_type == "application/octet-stream"
            || content_type == "binary/octet-stream"
        {
            content_type = sniff_content_type(&resp.body).to_string();
        }
        if !resp.body.is_empty()
            && !content_type_matches(&self.config.content_types, &content_type)
        {
            return Err(ProxyError::ContentType(content_type));
        }
        if let Ok(value) = HeaderValue::from_str(&content_type) {
            response_headers.insert(header::CONTENT_TYPE, value);
        }
        copy_header(&mut response_headers, &resp.headers, &["Content-Length"]);

        // enable CORS for third party applications
        response_headers
            .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        // prevent stored-XSS attacks via SVG responses
        response_headers.insert(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("script-src 'none'"),
        );
        // disable content-type sniffing in the browser
        response_headers
            .insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
        // block reflected XSS in legacy browsers without CSP support
        response_headers.insert(
            HeaderName::from_static("x-xss-protection"),
            HeaderValue::from_static("1; mode=block"),
        );

        let mut response = Response::new(Body::from(resp.body));
        *response.status_mut() = resp.status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

/// Builds the proxy router: health and metrics endpoints, with every other
/// path served as an image request.
pub fn router(proxy: Proxy) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health-check", get(health_check))
        .route("/favicon.ico", get(favicon))
        .route("/metrics", get(metrics_exposition))
        .fallback(serve_image)
        .with_state(Arc::new(proxy))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn favicon() {}

async fn metrics_exposition() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render(),
    )
}

async fn serve_image(State(proxy): State<Arc<Proxy>>, req: Request) -> Response {
    let (parts, _body) = req.into_parts();

    metrics::REQUESTS_IN_FLIGHT.inc();
    let started = std::time::Instant::now();

    let serve = async {
        match proxy.serve(&parts.uri, &parts.headers).await {
            Ok(response) => response,
            Err(err) => err.into_response(),
        }
    };
    let response = match proxy.config.timeout {
        Some(timeout) => tokio::time::timeout(timeout, serve).await.unwrap_or_else(|_| {
            (StatusCode::GATEWAY_TIMEOUT, MSG_GATEWAY_TIMEOUT).into_response()
        }),
        None => serve.await,
    };

    metrics::REQUEST_DURATION.observe(started.elapsed().as_secs_f64());
    metrics::REQUESTS_IN_FLIGHT.dec();

    response
}

/// Whether to answer 304 Not Modified for `req_headers` given the upstream
/// response, based on its entity tag and last modified time.
pub fn should304(req_headers: &HeaderMap, resp: &RemoteResponse) -> bool {
    let etag = resp.header_str(header::ETAG).unwrap_or_default();
    if !etag.is_empty()
        && req_headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok()) == Some(etag)
    {
        return true;
    }

    let Some(last_modified) =
        resp.header_str(header::LAST_MODIFIED).and_then(parse_http_date)
    else {
        return false;
    };
    let Some(if_modified_since) = req_headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_http_date)
    else {
        return false;
    };

    last_modified <= if_modified_since
}

/// Copies values for the named headers from `src` to `dst`, adding to any
/// existing values of the same name.
fn copy_header(dst: &mut HeaderMap, src: &HeaderMap, names: &[impl AsRef<str>]) {
    for name in names {
        if let Ok(name) = HeaderName::from_bytes(name.as_ref().as_bytes()) {
            for value in src.get_all(&name) {
                dst.append(name.clone(), value.clone());
            }
        }
    }
}

/// Detects the content type from the leading bytes of the body. Only image
/// formats are recognized; anything else reads as an opaque octet stream.
fn sniff_content_type(body: &[u8]) -> &'static str {
    let peek = &body[..body.len().min(512)];
    match image::guess_format(peek) {
        Ok(format) => format.to_mime_type(),
        Err(_) => "application/octet-stream",
    }
}

/// Whether `content_type` matches one of the allowed glob patterns. An
/// empty pattern list allows everything.
fn content_type_matches(patterns: &[String], content_type: &str) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns.iter().any(|pattern| glob_match(pattern, content_type))
}

/// Path-style glob matching: `*` matches any run of non-separator
/// characters, `?` matches a single one.
fn glob_match(pattern: &str, name: &str) -> bool {
    let mut pattern_chars = pattern.chars();
    match pattern_chars.next() {
        None => name.is_empty(),
        Some('*') => {
            let rest = pattern_chars.as_str();
            if glob_match(rest, name) {
                return true;
            }
            for (i, c) in name.char_indices() {
                if c == '/' {
                    return false;
                }
                if glob_match(rest, &name[i + c.len_utf8()..]) {
                    return true;
                }
            }
            false
        }
        Some('?') => {
            let mut name_chars = name.chars();
            match name_chars.next() {
                Some(c) if c != '/' => glob_match(pattern_chars.as_str(), name_chars.as_str()),
                _ => false,
            }
        }
        Some(expected) => {
            let mut name_chars = name.chars();
            name_chars.next() == Some(expected)
                && glob_match(pattern_chars.as_str(), name_chars.as_str())
        }
    }
}
