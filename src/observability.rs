//! Logging setup and the `#[obs]` instrumentation attribute.

pub use quickq_observability_macros::obs;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Debug, Default)]
pub struct ObservabilityOptions {
    /// Emit one JSON object per event instead of the human-readable format.
    pub json: bool,
    /// Explicit filter directive; wins over every environment variable.
    pub filter: Option<String>,
}

impl ObservabilityOptions {
    pub fn from_env() -> Self {
        Self {
            json: flag_set(std::env::var("QUICKQ_LOG_JSON").ok().as_deref()),
            filter: None,
        }
    }
}

/// Resolve the filter directive: `RUST_LOG` if set, otherwise the
/// `QUICKQ_LOG_DISABLED` / `QUICKQ_DEBUG` / `QUICKQ_INFO` switches, otherwise
/// warn.
pub fn default_filter_directive<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(directive) = lookup("RUST_LOG").filter(|value| !value.trim().is_empty()) {
        return directive;
    }
    let level = if flag_set(lookup("QUICKQ_LOG_DISABLED").as_deref()) {
        "off"
    } else if flag_set(lookup("QUICKQ_DEBUG").as_deref()) {
        "debug"
    } else if flag_set(lookup("QUICKQ_INFO").as_deref()) {
        "info"
    } else {
        "warn"
    };
    level.to_string()
}

/// Install the global subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_logging(options: ObservabilityOptions) {
    let directive = options
        .filter
        .unwrap_or_else(|| default_filter_directive(|key| std::env::var(key).ok()));
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("invalid log filter {directive:?}: {err}; falling back to warn");
        EnvFilter::new("warn")
    });

    let result = if options.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing init failed: {err}");
    }
}

fn flag_set(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}
