//! Tracing setup for binaries
//!
//! Library code only emits events; installing a subscriber is left to the
//! process entry point.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global subscriber filtered by `RUST_LOG`, else `default_filter`
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
