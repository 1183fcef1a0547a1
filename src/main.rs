use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tower_http::trace::TraceLayer;
use url::Url;

use imagegate::cache::{Cache, DiskCache, InMemoryCache, NopCache};
use imagegate::{router, Proxy, ProxyConfig};

/// imagegate - a caching image proxy server.
#[derive(Parser, Debug)]
#[command(name = "imagegate", about = "A caching image proxy server", version)]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "IMAGEGATE_ADDR", default_value = "0.0.0.0:8080")]
    addr: String,

    /// Hosts images may be proxied from (comma separated; supports
    /// "*.suffix" wildcards and CIDR ranges). Empty allows all hosts.
    #[arg(long, value_delimiter = ',')]
    allow_hosts: Vec<String>,

    /// Hosts images may never be proxied from.
    #[arg(long, value_delimiter = ',')]
    deny_hosts: Vec<String>,

    /// Hosts that inbound requests must carry a Referer from.
    #[arg(long, value_delimiter = ',')]
    referrers: Vec<String>,

    /// Pass the inbound Referer header along to the remote server.
    #[arg(long)]
    include_referer: bool,

    /// Do not follow redirects from the remote server.
    #[arg(long)]
    no_redirects: bool,

    /// Base URL that relative remote URLs are resolved against.
    #[arg(long)]
    base_url: Option<String>,

    /// HMAC keys for verifying signed requests (comma separated, any may
    /// match).
    #[arg(long, env = "IMAGEGATE_SIGNATURE_KEYS", value_delimiter = ',')]
    signature_keys: Vec<String>,

    /// Allow images to scale beyond their original dimensions.
    #[arg(long)]
    scale_up: bool,

    /// Request timeout in seconds; 0 means no timeout.
    #[arg(long, default_value_t = 0)]
    timeout: u64,

    /// Allowed response content types, as glob patterns.
    #[arg(long, value_delimiter = ',', default_value = "image/*")]
    content_types: Vec<String>,

    /// User-Agent sent with remote requests.
    #[arg(long)]
    user_agent: Option<String>,

    /// Inbound headers passed along to the remote server.
    #[arg(long, value_delimiter = ',')]
    pass_request_headers: Vec<String>,

    /// Upstream headers passed back to the client, replacing the default
    /// set (Cache-Control, Last-Modified, Expires, Etag, Link).
    #[arg(long, value_delimiter = ',')]
    pass_response_headers: Option<Vec<String>>,

    /// Minimum remote image cache duration in seconds, overriding shorter
    /// upstream cache headers.
    #[arg(long, default_value_t = 0)]
    min_cache_duration: u64,

    /// Cache all images, even when the remote server says 'private' or
    /// 'no-store'.
    #[arg(long)]
    force_cache: bool,

    /// Cache backend: "none", "memory:<size-mb>", or "disk:<path>".
    #[arg(long, default_value = "memory:256")]
    cache: String,

    /// Log additional debug messages.
    #[arg(long)]
    verbose: bool,
}

fn build_cache(spec: &str) -> Result<Arc<dyn Cache>, String> {
    if spec == "none" {
        return Ok(Arc::new(NopCache));
    }
    if let Some(size) = spec.strip_prefix("memory:") {
        let megabytes: u64 =
            size.parse().map_err(|_| format!("invalid memory cache size {size:?}"))?;
        return Ok(Arc::new(InMemoryCache::new(megabytes * 1024 * 1024)));
    }
    if let Some(dir) = spec.strip_prefix("disk:") {
        return Ok(Arc::new(DiskCache::new(PathBuf::from(dir))));
    }
    Err(format!("unknown cache backend {spec:?}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_filter = if args.verbose { "imagegate=debug" } else { "imagegate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let default_base_url = match &args.base_url {
        Some(base) => Some(Url::parse(base)?),
        None => None,
    };

    let config = ProxyConfig {
        allow_hosts: args.allow_hosts,
        deny_hosts: args.deny_hosts,
        referrers: args.referrers,
        include_referer: args.include_referer,
        follow_redirects: !args.no_redirects,
        default_base_url,
        signature_keys: args.signature_keys.into_iter().map(String::into_bytes).collect(),
        scale_up: args.scale_up,
        timeout: (args.timeout > 0).then(|| Duration::from_secs(args.timeout)),
        content_types: args.content_types,
        user_agent: args.user_agent,
        pass_request_headers: args.pass_request_headers,
        pass_response_headers: args.pass_response_headers,
        minimum_cache_duration: Duration::from_secs(args.min_cache_duration),
        force_cache: args.force_cache,
        verbose: args.verbose,
        time_now: None,
    };

    let cache = build_cache(&args.cache)?;
    let proxy = Proxy::new(config, cache)?;

    let app = router(proxy).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    tracing::info!(addr = %args.addr, cache = %args.cache, "imagegate listening");
    axum::serve(listener, app).await?;

    Ok(())
}
