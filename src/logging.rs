//! Tracing subscriber setup
//!
//! `RUST_LOG` wins when set; otherwise the crate logs at `level` and every
//! dependency at `info`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("crm_sync={level},info").into())
}

/// Install the global subscriber. Calling it twice is a no-op.
pub fn init(level: &str, json: bool) {
    let registry = tracing_subscriber::registry().with(filter(level));
    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
