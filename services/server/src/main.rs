use clap::Parser;
use hub_server::AppState;
use std::env;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hub-server", about = "Application-network hub server")]
struct Args {
    /// Bind host.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    /// Bind port.
    #[arg(long, default_value_t = 26423)]
    port: u16,
    /// Root directory for persistent table stores.  Without it,
    /// database-backed tables fall back to memory.
    #[arg(long)]
    data_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let args = Args::parse();
    let state = AppState::new(args.data_root);
    state.init().await;

    let bind_addr = format!("{}:{}", args.host, args.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(addr = %bind_addr, %error, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %bind_addr, "server listening");

    let shutdown = shutdown_signal(state.shutdown_signal());
    let router = hub_server::build_router(state);
    if let Err(error) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(%error, "server error");
        std::process::exit(1);
    }
    info!("server shut down gracefully");
}

/// Resolves on Ctrl-C, SIGTERM, or a `server:shutdown` endpoint call.
async fn shutdown_signal(mut requested: watch::Receiver<bool>) {
    use tokio::signal;

    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let endpoint = async {
        while !*requested.borrow() {
            if requested.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
        () = endpoint => info!("shutdown endpoint invoked, shutting down"),
    }
}
