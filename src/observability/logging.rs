//! Structured logging bootstrap.
//!
//! `RUST_LOG` takes precedence; otherwise the configured level applies to
//! this crate and everything else stays at `warn`.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Directive used when `RUST_LOG` is unset.
pub fn default_directive(config: &ObservabilityConfig) -> String {
    format!("warn,forward_proxy={}", config.log_level)
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_logging(config: &ObservabilityConfig) {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directive(config))),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
