use env_logger::Env;

/// Logger for the demo binary. `RUST_LOG` overrides the default `warn` filter.
pub fn init_logger() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();
}

/// Safe to call from every test; only the first call installs the logger.
pub fn init_test_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_module("amq_bench", log::LevelFilter::Debug)
        .try_init();
}
