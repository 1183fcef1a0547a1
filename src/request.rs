use std::borrow::Cow;
use std::sync::LazyLock;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use percent_encoding::percent_decode_str;
use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::options::Options;

/// A malformed request URL.
#[derive(Debug, Error, PartialEq)]
#[error("malformed URL {url:?}: {message}")]
pub struct UrlError {
    pub message: String,
    pub url: String,
}

impl UrlError {
    fn new(message: impl Into<String>, url: &str) -> Self {
        UrlError { message: message.into(), url: url.to_string() }
    }
}

/// A proxy request: the remote URL of an image to fetch, and an optional set
/// of transformations to perform.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRequest {
    /// Absolute URL of the image to proxy.
    pub url: Url,
    /// Image transformations to perform.
    pub options: Options,
}

// Repairs URLs whose scheme separator was collapsed by path cleaning or a
// webserver ("http:/example.com" -> "http://example.com").
static RE_CLEANED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(https?):/+([^/])").expect("valid cleaned-URL pattern"));

// Detects a percent-encoded absolute http(s) URL.
static RE_ENCODED_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?i)https?%3A%2F").expect("valid encoded-URL pattern"));

impl ImageRequest {
    /// Parses a request path (leading slash already stripped) into an
    /// `ImageRequest`. Options and the remote image URL are specified as
    /// `{options}/{remote_url}`; options may be omitted, leaving just
    /// `{remote_url}`.
    ///
    /// The remote URL may be included in plain text without any encoding,
    /// percent-encoded, or base64 encoded (URL safe, no padding). When no
    /// encoding is used, the inbound query string is treated as part of the
    /// remote URL; encoded forms carry their query inside the encoding and
    /// the inbound query is discarded. Base64 encoded URLs may be relative
    /// when a default base URL is configured.
    pub fn parse(
        path: &str,
        query: Option<&str>,
        base_url: Option<&Url>,
    ) -> Result<ImageRequest, UrlError> {
        let (candidate, mut encoded) = decode_url(path, base_url.is_some());
        let mut options = Options::default();

        let parsed = match Url::parse(&candidate) {
            Ok(url) => Ok(url),
            Err(_) => {
                // first segment should be options
                let Some((options_segment, url_segment)) = path.split_once('/') else {
                    return Err(UrlError::new("too few path segments", path));
                };

                options = Options::parse(options_segment);

                let (candidate, enc) = decode_url(url_segment, base_url.is_some());
                encoded = enc;
                match base_url {
                    Some(base) => base.join(&candidate),
                    None => Url::parse(&candidate),
                }
                .map_err(|err| {
                    UrlError::new(format!("unable to parse remote URL: {err}"), path)
                })
            }
        };

        let mut url = match (parsed, base_url) {
            (Ok(url), Some(base)) => base
                .join(url.as_str())
                .map_err(|err| UrlError::new(format!("unable to parse remote URL: {err}"), path))?,
            (Ok(url), None) => url,
            (Err(err), _) => return Err(err),
        };

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(UrlError::new("remote URL must have http or https scheme", path));
        }

        if !encoded {
            // the query string is part of the remote URL
            url.set_query(query.filter(|q| !q.is_empty()));
        }

        Ok(ImageRequest { url, options })
    }

    /// The request URL with the canonical options string encoded in the URL
    /// fragment. This is the cache key for the transformed variant.
    pub fn canonical_url(&self) -> Url {
        let mut url = self.url.clone();
        let options = self.options.to_string();
        url.set_fragment(Some(&options));
        url
    }
}

/// Decodes a path segment as a remote URL, handling the three supported
/// encodings. Returns the decoded string and whether any decoding occurred.
fn decode_url(segment: &str, has_base: bool) -> (String, bool) {
    let mut s: Cow<'_, str> = Cow::Borrowed(segment);
    let mut encoded = false;

    // Try to base64 decode the segment. This fails quickly on the first
    // invalid character like ":", ".", or "/". Accept the decoded string if
    // it looks like an absolute HTTP URL, or if a base URL is configured and
    // the decoded bytes contained no invalid code points. This lets values
    // like "/path", which do decode but not to valid text, fall through as
    // unencoded strings.
    if let Ok(bytes) = URL_SAFE_NO_PAD.decode(segment.as_bytes()) {
        let decoded = String::from_utf8_lossy(&bytes);
        if decoded.starts_with("http://") || decoded.starts_with("https://") {
            encoded = true;
            s = Cow::Owned(decoded.into_owned());
        } else if has_base && !decoded.contains('\u{FFFD}') {
            encoded = true;
            s = Cow::Owned(decoded.into_owned());
        }
    }

    // If the segment looks like a percent-encoded absolute http(s) URL,
    // decode it.
    if RE_ENCODED_URL.is_match(&s) {
        if let Ok(decoded) = percent_decode_str(&s).decode_utf8() {
            let decoded = decoded.into_owned();
            encoded = true;
            s = Cow::Owned(decoded);
        }
    }

    let repaired = RE_CLEANED_URL.replace(&s, "${1}://${2}");
    (repaired.into_owned(), encoded)
}
