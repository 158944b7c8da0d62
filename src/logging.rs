// src/logging.rs
use tracing_subscriber::EnvFilter;

pub fn initialize_tracing(debug: bool) {
    let filter = if let Ok(filter) = std::env::var("RUST_LOG") {
        EnvFilter::new(filter)
    } else if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();
}
