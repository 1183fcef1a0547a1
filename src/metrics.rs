use std::sync::LazyLock;

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
    TextEncoder,
};

/// Time spent handling proxy requests.
pub static REQUEST_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "imagegate_request_duration_seconds",
        "Time spent handling image requests"
    )
    .expect("metric registration should succeed at startup")
});

/// Requests currently being handled.
pub static REQUESTS_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    register_int_gauge!(
        "imagegate_requests_in_flight",
        "Number of image requests currently being served"
    )
    .expect("metric registration should succeed at startup")
});

/// Upstream fetches that failed after all retries.
pub static REMOTE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "imagegate_remote_errors_total",
        "Errors fetching remote images"
    )
    .expect("metric registration should succeed at startup")
});

/// Responses answered from the cache.
pub static SERVED_FROM_CACHE: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "imagegate_served_from_cache_total",
        "Responses served from the cache"
    )
    .expect("metric registration should succeed at startup")
});

/// Renders all registered metrics in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buf = String::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode_utf8(&prometheus::gather(), &mut buf) {
        tracing::error!(error = %err, "error encoding metrics");
    }
    buf
}
