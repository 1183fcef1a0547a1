use std::net::IpAddr;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use hmac::{Hmac, Mac};
use ipnet::IpNet;
use sha2::Sha256;
use thiserror::Error;
use url::{Host, Url};

use crate::config::ProxyConfig;
use crate::request::ImageRequest;

type HmacSha256 = Hmac<Sha256>;

/// Why a request was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("request is no longer valid")]
    NotValid,
    #[error("request does not contain an allowed referrer")]
    Referrer,
    #[error("request contains a denied host")]
    DeniedHost,
    #[error("request does not contain an allowed host or valid signature")]
    NotAllowed,
}

/// Determines whether the request carries an allowed referrer, host, and
/// signature, and is still within its validity window. Checks short-circuit
/// on the first rejection.
pub fn allowed(
    req: &ImageRequest,
    referer: Option<&str>,
    config: &ProxyConfig,
) -> Result<(), AuthError> {
    if let Some(valid_until) = req.options.valid_until {
        if config.now() >= valid_until {
            return Err(AuthError::NotValid);
        }
    }

    if !config.referrers.is_empty() && !referrer_matches(&config.referrers, referer) {
        return Err(AuthError::Referrer);
    }

    if host_matches(&config.deny_hosts, &req.url) {
        return Err(AuthError::DeniedHost);
    }

    if config.allow_hosts.is_empty() && config.signature_keys.is_empty() {
        // no allowed hosts or signature keys, all requests accepted
        return Ok(());
    }

    if !config.allow_hosts.is_empty() && host_matches(&config.allow_hosts, &req.url) {
        return Ok(());
    }

    for key in &config.signature_keys {
        if !key.is_empty() && valid_signature(key, req) {
            return Ok(());
        }
    }

    Err(AuthError::NotAllowed)
}

/// Whether the host in `url` matches one of `hosts`. A pattern matches on
/// exact hostname equality, a `*.` prefix with a matching suffix, or CIDR
/// containment when the URL host is an IP address.
pub fn host_matches(hosts: &[String], url: &Url) -> bool {
    let hostname = match url.host() {
        Some(Host::Domain(domain)) => domain.to_string(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => return false,
    };
    let ip: Option<IpAddr> = hostname.parse().ok();

    for host in hosts {
        if hostname == *host {
            return true;
        }
        if let Some(suffix) = host.strip_prefix("*.") {
            if hostname.ends_with(suffix) {
                return true;
            }
        }
        if let (Some(ip), Ok(net)) = (ip, host.parse::<IpNet>()) {
            if net.contains(&ip) {
                return true;
            }
        }
    }

    false
}

/// Whether the Referer header names a host in `hosts`. A missing or
/// malformed header never matches.
pub fn referrer_matches(hosts: &[String], referer: Option<&str>) -> bool {
    let Some(referer) = referer else { return false };
    match Url::parse(referer) {
        Ok(url) => host_matches(hosts, &url),
        Err(_) => false,
    }
}

/// Whether the request signature is valid under `key`.
///
/// The signature is accepted if it verifies over the bare remote URL, or
/// over the remote URL with the canonical options (signature token removed)
/// in the fragment. Comparison is constant time.
pub fn valid_signature(key: &[u8], req: &ImageRequest) -> bool {
    let mut sig = req.options.signature.clone();
    let rem = sig.len() % 4;
    if rem != 0 {
        // add padding if missing
        sig.push_str(&"=".repeat(4 - rem));
    }

    let got = match URL_SAFE.decode(sig.as_bytes()) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(signature = %req.options.signature, error = %err, "error base64 decoding signature");
            return false;
        }
    };

    // check signature over the URL alone
    if verify(key, req.url.as_str().as_bytes(), &got) {
        return true;
    }

    // check signature over the URL with options
    let mut url = req.url.clone();
    let mut options = req.options.clone();
    options.signature = String::new();
    let options = options.to_string();
    url.set_fragment(Some(&options));

    verify(key, url.as_str().as_bytes(), &got)
}

fn verify(key: &[u8], payload: &[u8], signature: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use chrono::DateTime;

    fn request(url: &str) -> ImageRequest {
        ImageRequest { url: Url::parse(url).unwrap(), options: Options::default() }
    }

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn sign(key: &[u8], payload: &str) -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn host_matching() {
        let list = hosts(&["a.test", "*.b.test", "192.168.0.0/16"]);

        for allowed in [
            "http://a.test/image",
            "http://x.b.test/image",
            "http://x.y.b.test/image",
            "http://192.168.1.1/image",
        ] {
            assert!(host_matches(&list, &Url::parse(allowed).unwrap()), "{allowed}");
        }

        for denied in [
            "http://b.test/image",
            "http://aa.test/image",
            "http://a.test.com/image",
            "http://192.169.1.1/image",
        ] {
            assert!(!host_matches(&list, &Url::parse(denied).unwrap()), "{denied}");
        }
    }

    #[test]
    fn referrer_matching() {
        let list = hosts(&["gopher.test"]);
        assert!(referrer_matches(&list, Some("http://gopher.test/page")));
        assert!(!referrer_matches(&list, Some("http://other.test/page")));
        assert!(!referrer_matches(&list, Some("not a url")));
        assert!(!referrer_matches(&list, None));
    }

    #[test]
    fn open_proxy_accepts_everything() {
        let config = ProxyConfig::default();
        assert_eq!(allowed(&request("http://anywhere.test/i.jpg"), None, &config), Ok(()));
    }

    #[test]
    fn deny_list_rejects_before_allow() {
        let config = ProxyConfig {
            allow_hosts: hosts(&["bad.test"]),
            deny_hosts: hosts(&["bad.test"]),
            ..Default::default()
        };
        assert_eq!(
            allowed(&request("http://bad.test/i.jpg"), None, &config),
            Err(AuthError::DeniedHost)
        );
    }

    #[test]
    fn allow_list_limits_hosts() {
        let config = ProxyConfig { allow_hosts: hosts(&["good.test"]), ..Default::default() };
        assert_eq!(allowed(&request("http://good.test/i.jpg"), None, &config), Ok(()));
        assert_eq!(
            allowed(&request("http://other.test/i.jpg"), None, &config),
            Err(AuthError::NotAllowed)
        );
    }

    #[test]
    fn referrer_required_when_configured() {
        let config = ProxyConfig { referrers: hosts(&["site.test"]), ..Default::default() };
        assert_eq!(
            allowed(&request("http://any.test/i.jpg"), Some("http://site.test/"), &config),
            Ok(())
        );
        assert_eq!(
            allowed(&request("http://any.test/i.jpg"), None, &config),
            Err(AuthError::Referrer)
        );
    }

    #[test]
    fn valid_until_expiry() {
        let config = ProxyConfig {
            time_now: DateTime::from_timestamp(100, 0),
            ..Default::default()
        };

        let mut req = request("http://example.test/i.jpg");
        req.options.valid_until = DateTime::from_timestamp(101, 0);
        assert_eq!(allowed(&req, None, &config), Ok(()));

        req.options.valid_until = DateTime::from_timestamp(100, 0);
        assert_eq!(allowed(&req, None, &config), Err(AuthError::NotValid));

        req.options.valid_until = DateTime::from_timestamp(99, 0);
        assert_eq!(allowed(&req, None, &config), Err(AuthError::NotValid));
    }

    #[test]
    fn signature_over_bare_url() {
        let key = b"secret-key";
        let mut req = request("http://example.test/image.jpg");
        req.options.signature = sign(key, "http://example.test/image.jpg");
        assert!(valid_signature(key, &req));
    }

    #[test]
    fn signature_over_url_with_options() {
        let key = b"secret-key";
        let mut req = request("http://example.test/image.jpg");
        req.options = Options::parse("100x200,r90");
        req.options.signature = sign(key, "http://example.test/image.jpg#100x200,r90");
        assert!(valid_signature(key, &req));
    }

    #[test]
    fn signature_rejects_wrong_key() {
        let mut req = request("http://example.test/image.jpg");
        req.options.signature = sign(b"key-one", "http://example.test/image.jpg");
        assert!(!valid_signature(b"key-two", &req));
    }

    #[test]
    fn signature_rejects_garbage() {
        let mut req = request("http://example.test/image.jpg");
        req.options.signature = "!!not-base64!!".to_string();
        assert!(!valid_signature(b"key", &req));
    }

    #[test]
    fn key_rotation_tries_all_keys() {
        let old_key = b"old-key".to_vec();
        let new_key = b"new-key".to_vec();
        let config = ProxyConfig {
            signature_keys: vec![new_key, old_key.clone()],
            ..Default::default()
        };

        let mut req = request("http://example.test/image.jpg");
        req.options.signature = sign(&old_key, "http://example.test/image.jpg");
        assert_eq!(allowed(&req, None, &config), Ok(()));
    }
}
