// src/main.rs
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rwp::lan::LanAgent;
use rwp::proxy::LocalProxy;
use rwp::relay::RelayServer;
use rwp::{initialize_tracing, Cli, Command, LanConfig, ProxyConfig, ServerConfig};

#[tokio::main]
async fn main() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install ring CryptoProvider");

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler");
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
                .expect("Failed to install SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => info!(signal = "SIGTERM", "Shutdown signal received."),
                _ = sigint.recv() => info!(signal = "SIGINT", "Shutdown signal received."),
            }
        }
        #[cfg(not(unix))]
        {
            signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
            info!(signal = "SIGINT", "Shutdown signal received.");
        }
        shutdown_signal.cancel();
    });

    if let Err(e) = run(cli, shutdown).await {
        eprintln!("rwp: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, shutdown: CancellationToken) -> Result<(), rwp::BoxError> {
    match cli.command {
        Command::Server(args) => {
            initialize_tracing(args.debug);
            if args.generate_config {
                return ServerConfig::generate_default_file(&args.config);
            }
            let config = ServerConfig::load(&args)?;
            info!(
                addr = %config.listen_addr(),
                version = env!("CARGO_PKG_VERSION"),
                "Relay server starting."
            );
            RelayServer::bind(config).await?.run(shutdown).await
        }
        Command::Lan(args) => {
            initialize_tracing(args.debug);
            if args.generate_config {
                return LanConfig::generate_default_file(&args.config);
            }
            let config = LanConfig::load(&args)?;
            LanAgent::new(config).run(shutdown).await
        }
        Command::Proxy(args) => {
            initialize_tracing(args.debug);
            if args.generate_config {
                return ProxyConfig::generate_default_file(&args.config);
            }
            let config = ProxyConfig::load(&args)?;
            LocalProxy::bind(config).await?.run(shutdown).await
        }
    }
}
