//! Tracing subscriber setup and the metric names the services emit.
//!
//! The services only talk to the `metrics` facade; installing an exporter is
//! left to the embedding binary.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

pub const REBUILDS_SIGNALLED_TOTAL: &str = "tabledex_rebuilds_signalled_total";
pub const STATUS_CONFLICTS_TOTAL: &str = "tabledex_status_conflicts_total";
pub const READ_LOCK_TIMEOUTS_TOTAL: &str = "tabledex_read_lock_timeouts_total";
pub const QUERIES_TOTAL: &str = "tabledex_queries_total";
pub const QUERY_DURATION_SECONDS: &str = "tabledex_query_duration_seconds";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs the global subscriber. The filter comes from `RUST_LOG` and
/// defaults to `info`.
///
/// Returns `false` when a subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };
    installed.is_ok()
}

pub(crate) fn record_rebuild_signalled() {
    metrics::counter!(REBUILDS_SIGNALLED_TOTAL).increment(1);
}

pub(crate) fn record_status_conflict() {
    metrics::counter!(STATUS_CONFLICTS_TOTAL).increment(1);
}

pub(crate) fn record_read_lock_timeout() {
    metrics::counter!(READ_LOCK_TIMEOUTS_TOTAL).increment(1);
}

pub(crate) fn record_query(consistent: bool, elapsed: std::time::Duration) {
    metrics::counter!(QUERIES_TOTAL, "consistent" => if consistent { "true" } else { "false" })
        .increment(1);
    metrics::histogram!(QUERY_DURATION_SECONDS).record(elapsed.as_secs_f64());
}
