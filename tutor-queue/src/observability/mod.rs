pub mod metrics;

pub use metrics::{GlobalMetrics, KindMetrics, LiveMetrics, MetricsSnapshot};

/// Initialize tracing for the process, filtered by `RUST_LOG` (default `info`).
///
/// `json` selects one JSON object per line. Safe to call multiple times;
/// later calls are no-ops.
#[cfg(feature = "tracing-basic")]
pub fn init_tracing(json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime);

    let _ = if json {
        builder.json().with_target(false).try_init()
    } else {
        builder.with_target(true).try_init()
    };
}
