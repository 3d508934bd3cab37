//! oauth-proxy - caching OAuth2 ROPC token proxy
//!
//! Reduces load on a downstream authorization provider by caching token
//! responses keyed by the full credential tuple.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use oauth_proxy::{
    cli::{Cli, Command},
    client,
    config::Config,
    proxy::Service,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            downstream,
            port,
            silent,
        } => run_server(cli.config.as_deref(), downstream.as_deref(), port, silent).await,
        Command::Request { secrets_file } => run_request(&secrets_file).await,
    }
}

/// Run the proxy server until a shutdown signal arrives
async fn run_server(
    config_path: Option<&Path>,
    downstream: Option<&str>,
    port: Option<u16>,
    silent: bool,
) -> ExitCode {
    let config = match Config::load(config_path) {
        Ok(mut config) => {
            config.apply_cli_overrides(downstream, port, silent);
            config
        }
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let level = if config.serve.silent { "off" } else { "info" };
    if let Err(e) = setup_tracing(level) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.serve.port,
        endpoint = %config.serve.downstream,
        pool_size = config.serve.pool_size,
        "Starting oauth proxy"
    );

    let service = match Service::new(config.to_settings()).await {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to start service: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = service.run(shutdown_signal()).await {
        error!("Service error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Proxy shutdown complete");
    ExitCode::SUCCESS
}

/// Fetch a single token using a secrets file and print it
async fn run_request(secrets_file: &Path) -> ExitCode {
    let secrets = match client::load_secrets(secrets_file) {
        Ok(secrets) => secrets,
        Err(e) => {
            eprintln!("Failed to load secrets: {e}");
            return ExitCode::FAILURE;
        }
    };

    match client::request_token(&secrets).await {
        Ok(token) => {
            println!("{} {}", token.token_type(), token.access_token);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Token request failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
