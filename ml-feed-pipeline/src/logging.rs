//! Tracing subscriber setup for binaries and tests

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `ML_FEED_LOG`, then `RUST_LOG`,
/// then `info`. Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .try_init();
}

/// Filter read from `ML_FEED_LOG`, falling back to `RUST_LOG` and `info`
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("ML_FEED_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing();
        init_tracing();
        tracing::info!("logging initialised twice");
    }
}
