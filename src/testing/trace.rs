use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber for tests, the level comes from `TEST_LOG`
/// and defaults to `warn`. Safe to call from every test.
pub fn trace_init() {
    let levels = std::env::var("TEST_LOG").unwrap_or_else(|_| "warn".into());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(levels))
        .with_test_writer()
        .try_init();
}
