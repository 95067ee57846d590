use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;
use vault_secrets_reloader::config::{Cli, Config};
use vault_secrets_reloader::controller::Controller;
use vault_secrets_reloader::webserver;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    info!("starting vault-secrets-reloader {}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let listen_address = config.listen_address.clone();
    let controller = Controller::bootstrap(config).await?;

    let cancel = CancellationToken::new();

    let app = webserver::create_app();
    let listener = tokio::net::TcpListener::bind(normalize_listen_address(&listen_address)).await?;
    info!("starting health endpoint on {}", listen_address);
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let cancel = cancel.clone();
        async move { cancel.cancelled().await }
    });

    // Spawned rather than raced in the same select!: a select! arm that
    // resolves first drops the other arms' futures outright, which would cut
    // the reloader off mid-round instead of letting it observe `cancel` and
    // wind down. Spawning lets the shutdown signal fire on its own, then we
    // wait for both tasks to actually finish.
    let server_task = tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!(error = %err, "health endpoint server failed");
        }
    });
    let controller_task = tokio::spawn(controller.run(cli.collector_sync_period, cli.reloader_run_period, cancel.clone()));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    cancel.cancel();

    let (server_result, controller_result) = tokio::join!(server_task, controller_task);
    server_result.context("health endpoint task panicked")?;
    controller_result.context("controller task panicked")?;

    info!("controller stopped; exiting");
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.enable_json_log {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn normalize_listen_address(address: &str) -> String {
    if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        address.to_string()
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
