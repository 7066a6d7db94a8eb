use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "devicelink=info,tower_http=info";

/// Install the global subscriber. `RUST_LOG` overrides the default filter and
/// `DEVICELINK_LOG_FORMAT=json` switches to structured JSON lines.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = std::env::var("DEVICELINK_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    // A second init (tests, embedding) keeps the first subscriber.
    let result = if json {
        registry.with(fmt::layer().json().with_current_span(false)).try_init()
    } else {
        registry.with(fmt::layer().compact().with_target(false)).try_init()
    };

    if let Err(e) = result {
        tracing::debug!("Tracing already initialized: {}", e);
    }
}
