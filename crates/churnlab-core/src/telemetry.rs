//! Tracing initialisation for churnlab binaries.
//!
//! Call [`init_tracing`] once at program start. Later calls are ignored
//! because the global subscriber can only be set once per process.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::HarnessConfig;

/// Crates whose events make up the reproduction trace.
const HARNESS_TARGETS: [&str; 2] = ["churnlab_core", "churnlab"];

/// Filter directives used when `RUST_LOG` is not set.
///
/// Harness targets log at `info` (or `debug` when `debug` is set). Everything
/// else, including the messaging client's own dependencies, stays at `warn`
/// so the churn and delivery events are not buried.
pub fn default_directives(debug: bool) -> String {
    let level = if debug { "debug" } else { "info" };
    let mut directives = vec!["warn".to_string()];
    directives.extend(HARNESS_TARGETS.iter().map(|t| format!("{t}={level}")));
    directives.join(",")
}

/// Initialise the global tracing subscriber for a run.
///
/// * `json` - emit newline-delimited JSON log lines instead of text.
/// * `config.debug` - raise harness targets to `debug` when `RUST_LOG` is unset.
///
/// JSON lines keep the target so events can be filtered by module; text
/// lines drop it to stay readable.
pub fn init_tracing(config: &HarnessConfig, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config.debug)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).json().flatten_event(true))
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}
