use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use http::header::{CACHE_CONTROL, DATE, EXPIRES};
use http::{HeaderMap, HeaderValue};

/// A parsed Cache-Control header: directive names (lowercased) mapped to
/// their values (empty for value-less directives). Serialization is
/// deterministic so rewritten headers are stable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheControl(BTreeMap<String, String>);

impl CacheControl {
    pub fn parse(s: &str) -> CacheControl {
        let mut directives = BTreeMap::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((name, value)) => {
                    directives.insert(
                        name.trim().to_ascii_lowercase(),
                        value.trim().trim_matches('"').to_string(),
                    );
                }
                None => {
                    directives.insert(part.to_ascii_lowercase(), String::new());
                }
            }
        }
        CacheControl(directives)
    }

    pub fn from_headers(headers: &HeaderMap) -> CacheControl {
        let value = headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        CacheControl::parse(value)
    }

    pub fn contains(&self, directive: &str) -> bool {
        self.0.contains_key(directive)
    }

    pub fn get(&self, directive: &str) -> Option<&str> {
        self.0.get(directive).map(String::as_str)
    }

    pub fn insert(&mut self, directive: &str, value: &str) {
        self.0.insert(directive.to_string(), value.to_string());
    }

    pub fn remove(&mut self, directive: &str) {
        self.0.remove(directive);
    }

    fn write_to(&self, headers: &mut HeaderMap) {
        if let Ok(value) = HeaderValue::from_str(&self.to_string()) {
            headers.insert(CACHE_CONTROL, value);
        }
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.0 {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            if value.is_empty() {
                f.write_str(name)?;
            } else {
                write!(f, "{name}={value}")?;
            }
        }
        Ok(())
    }
}

/// Rewrites the cache-control headers of an upstream response for storage in
/// a shared cache.
///
/// The `private` directive is promoted to `no-store`: upstream caches built
/// for single-user use ignore `private`, but a shared image cache must not
/// store such responses. When `force_cache` is set, `private` and `no-store`
/// are both removed instead.
///
/// When a minimum cache duration is configured, `max-age` is raised to the
/// maximum of that minimum, the Expires-derived lifetime, and the existing
/// `max-age`, and the Expires header is dropped.
pub fn update_cache_headers(
    headers: &mut HeaderMap,
    force_cache: bool,
    minimum_cache_duration: Duration,
) {
    let mut cc = CacheControl::from_headers(headers);

    if force_cache {
        cc.remove("private");
        cc.remove("no-store");
        cc.write_to(headers);
    } else {
        if cc.contains("private") {
            cc.insert("no-store", "");
            cc.write_to(headers);
            return;
        }
        if cc.contains("no-store") {
            return;
        }
    }

    if minimum_cache_duration.is_zero() {
        return;
    }

    let mut expires_duration = TimeDelta::zero();
    let mut max_age_duration = TimeDelta::zero();

    if let Some(secs) = cc.get("max-age").and_then(|v| v.parse::<i64>().ok()) {
        max_age_duration = TimeDelta::seconds(secs);
    }
    if let Some(date) = header_date(headers, &DATE) {
        if let Some(expires) = header_date(headers, &EXPIRES) {
            expires_duration = expires - date;
        }
    }

    let minimum = TimeDelta::seconds(minimum_cache_duration.as_secs() as i64);
    let max_age = minimum.max(expires_duration).max(max_age_duration);

    cc.insert("max-age", &max_age.num_seconds().to_string());
    cc.write_to(headers);
    headers.remove(EXPIRES);
}

/// Parses an RFC 1123 date header (the `GMT`-suffixed IMF-fixdate form).
pub fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s).ok().map(|t| t.with_timezone(&Utc))
}

/// Formats an instant as an RFC 1123 date header value.
pub fn format_http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn header_date(headers: &HeaderMap, name: &http::header::HeaderName) -> Option<DateTime<Utc>> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(parse_http_date)
}
