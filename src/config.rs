use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

/// Proxy configuration, read-only after construction and safe for
/// concurrent use.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Remote hosts that images may be proxied from. An empty list allows
    /// all hosts (subject to the deny list and signatures).
    pub allow_hosts: Vec<String>,

    /// Remote hosts that images may never be proxied from.
    pub deny_hosts: Vec<String>,

    /// When non-empty, requests must carry a Referer header from one of
    /// these hosts.
    pub referrers: Vec<String>,

    /// Pass the inbound Referer header along to the remote server.
    pub include_referer: bool,

    /// Follow redirects from the remote server, re-checking the deny list
    /// at every hop.
    pub follow_redirects: bool,

    /// Base URL that relative remote URLs are resolved against. When unset,
    /// remote URLs must be absolute.
    pub default_base_url: Option<Url>,

    /// HMAC keys used to verify signed requests; any key may match, which
    /// allows rotation.
    pub signature_keys: Vec<Vec<u8>>,

    /// Allow images to scale beyond their original dimensions.
    pub scale_up: bool,

    /// Time limit for serving a request; exceeding it answers 504.
    pub timeout: Option<Duration>,

    /// Content types allowed in responses, as glob patterns. An empty list
    /// allows everything.
    pub content_types: Vec<String>,

    /// User-Agent sent with remote requests.
    pub user_agent: Option<String>,

    /// Inbound headers passed along to the remote server.
    pub pass_request_headers: Vec<String>,

    /// Upstream headers passed back to the client. When None, a default set
    /// is passed: Cache-Control, Last-Modified, Expires, Etag, Link.
    pub pass_response_headers: Option<Vec<String>>,

    /// Minimum duration to cache remote images, overriding shorter upstream
    /// cache headers.
    pub minimum_cache_duration: Duration,

    /// Cache all images, even when the remote server says 'private' or
    /// 'no-store'.
    pub force_cache: bool,

    /// Log additional debug messages.
    pub verbose: bool,

    /// Fixed current time, used by tests.
    pub time_now: Option<DateTime<Utc>>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            allow_hosts: Vec::new(),
            deny_hosts: Vec::new(),
            referrers: Vec::new(),
            include_referer: false,
            follow_redirects: true,
            default_base_url: None,
            signature_keys: Vec::new(),
            scale_up: false,
            timeout: None,
            content_types: vec!["image/*".to_string()],
            user_agent: None,
            pass_request_headers: Vec::new(),
            pass_response_headers: None,
            minimum_cache_duration: Duration::ZERO,
            force_cache: false,
            verbose: false,
            time_now: None,
        }
    }
}

impl ProxyConfig {
    /// The current time, honoring the test override.
    pub fn now(&self) -> DateTime<Utc> {
        self.time_now.unwrap_or_else(Utc::now)
    }
}
