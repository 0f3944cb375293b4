use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Install a test-friendly subscriber once per test binary. `RUST_LOG`
/// controls verbosity; output is captured per test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let fmt_layer = fmt::layer()
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(false);

        let env_filter = EnvFilter::builder()
            .with_default_directive(tracing::Level::WARN.into())
            .from_env_lossy();

        let _ = Registry::default()
            .with(fmt_layer)
            .with(env_filter)
            .try_init();
    });
}
