//! Shared test setup for the integration suites.

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a `tracing` subscriber for the test binary, once. Lets `cargo
/// test -- --nocapture` surface the `tracing::debug!`/`warn!` calls the
/// pool and hash map emit on growth/exhaustion.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "triton=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
