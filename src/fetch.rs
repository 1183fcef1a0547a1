use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{HeaderMap, StatusCode};
use reqwest::redirect;
use thiserror::Error;
use url::Url;

use crate::config::ProxyConfig;

/// Maximum number of redirection-followings allowed.
const MAX_REDIRECTS: usize = 10;

pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// An outbound GET request flowing through the transport stack. The URL may
/// carry transformation options in its fragment; the fragment is never sent
/// on the wire.
#[derive(Clone, Debug)]
pub struct RemoteRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

impl RemoteRequest {
    pub fn new(url: Url) -> Self {
        RemoteRequest { url, headers: HeaderMap::new() }
    }
}

/// A fully-buffered upstream response.
#[derive(Clone, Debug)]
pub struct RemoteResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RemoteResponse {
    pub fn new(status: StatusCode) -> Self {
        RemoteResponse { status, headers: HeaderMap::new(), body: Bytes::new() }
    }

    pub fn header_str(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{0}")]
    Http(reqwest::Error),
    #[error("requested URL in redirect is not allowed")]
    RedirectDenied,
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("internal transport error: {0}")]
    Internal(String),
}

/// One hop of the outbound transport stack.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: &RemoteRequest) -> Result<RemoteResponse, FetchError>;
}

#[derive(Debug, Error)]
enum RedirectError {
    #[error("denied redirect host")]
    Denied,
    #[error("followed too many redirects")]
    TooMany,
}

/// The transport that actually talks to the network, backed by a reqwest
/// client. The redirect policy is fixed at construction: when following is
/// enabled, each hop re-checks the deny-host list and the hop count.
pub struct WireTransport {
    client: reqwest::Client,
}

impl WireTransport {
    pub fn new(config: &ProxyConfig) -> Result<Self, FetchError> {
        let policy = if config.follow_redirects {
            let deny_hosts = config.deny_hosts.clone();
            redirect::Policy::custom(move |attempt| {
                if attempt.previous().len() > MAX_REDIRECTS {
                    return attempt.error(RedirectError::TooMany);
                }
                if crate::auth::host_matches(&deny_hosts, attempt.url()) {
                    return attempt.error(RedirectError::Denied);
                }
                attempt.follow()
            })
        } else {
            redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .redirect(policy)
            .build()
            .map_err(FetchError::Http)?;

        Ok(WireTransport { client })
    }
}

#[async_trait]
impl Transport for WireTransport {
    async fn round_trip(&self, req: &RemoteRequest) -> Result<RemoteResponse, FetchError> {
        let mut url = req.url.clone();
        url.set_fragment(None);

        let resp = self
            .client
            .get(url)
            .headers(req.headers.clone())
            .send()
            .await
            .map_err(classify_error)?;

        let status = resp.status();
        let headers = resp.headers().clone();

        let mut buf = BytesMut::with_capacity(8192);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await.transpose().map_err(classify_error)? {
            buf.extend_from_slice(&chunk);
        }

        Ok(RemoteResponse { status, headers, body: buf.freeze() })
    }
}

/// Recovers a redirect-policy rejection from reqwest's error chain so the
/// handler can answer 403 instead of a generic fetch failure.
fn classify_error(err: reqwest::Error) -> FetchError {
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        if let Some(redirect_err) = inner.downcast_ref::<RedirectError>() {
            return match redirect_err {
                RedirectError::Denied => FetchError::RedirectDenied,
                RedirectError::TooMany => FetchError::TooManyRedirects,
            };
        }
        source = inner.source();
    }
    FetchError::Http(err)
}

/// Executes `req`, retrying on connection errors, 5xx responses, and 429
/// responses, with a linear backoff. A 200 is returned immediately; any
/// other terminal status is returned without further retries.
pub async fn do_with_retries(
    transport: &dyn Transport,
    req: &RemoteRequest,
) -> Result<RemoteResponse, FetchError> {
    let mut outcome = transport.round_trip(req).await;

    for attempt in 1..=MAX_RETRIES {
        match &outcome {
            Err(_) => {}
            Ok(resp) if resp.status == StatusCode::OK => return outcome,
            Ok(resp)
                if resp.status.is_server_error()
                    || resp.status == StatusCode::TOO_MANY_REQUESTS => {}
            Ok(_) => return outcome,
        }

        tokio::time::sleep(RETRY_INTERVAL * attempt).await;
        tracing::debug!(attempt, url = %req.url, "retrying remote fetch");
        outcome = transport.round_trip(req).await;
    }

    outcome
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// A transport that replays a scripted list of outcomes and records how
    /// many round trips were made.
    pub struct ScriptedTransport {
        script: Mutex<Vec<Result<RemoteResponse, FetchError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        pub fn new(script: Vec<Result<RemoteResponse, FetchError>>) -> Self {
            let mut script = script;
            script.reverse();
            ScriptedTransport { script: Mutex::new(script), calls: AtomicUsize::new(0) }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn round_trip(&self, _req: &RemoteRequest) -> Result<RemoteResponse, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .expect("script lock")
                .pop()
                .unwrap_or(Err(FetchError::Internal("script exhausted".to_string())))
        }
    }

    pub fn response(status: u16) -> RemoteResponse {
        RemoteResponse::new(StatusCode::from_u16(status).expect("valid status"))
    }
}
