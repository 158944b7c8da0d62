// src/lib.rs
pub mod config;
pub mod dial;
pub mod insecure_cert;
pub mod lan;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod relay;
pub mod transport;

pub use config::*;
pub use logging::initialize_tracing;
pub use protocol::*;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
