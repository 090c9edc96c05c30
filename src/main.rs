use std::sync::Arc;

use flow_exec::config::{ExecConfig, ServerConfig};
use flow_exec::exec::ExecCoordinator;
use flow_exec::server::routes;
use flow_exec::worker::{ShellLauncher, ShellWorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let exec_config = ExecConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;

    eprintln!("Flow Exec v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   HTTP: http://0.0.0.0:{}", server_config.port);
    eprintln!("   Live WS: ws://0.0.0.0:{}/ws", server_config.port);
    eprintln!("   Shell: {}", server_config.shell);
    eprintln!(
        "   Execution timeout: {}",
        if exec_config.timeout_enabled() {
            format!(
                "{}s (restart: {})",
                exec_config.exec_timeout.as_secs(),
                exec_config.restart_on_timeout
            )
        } else {
            "off".to_string()
        }
    );
    eprintln!(
        "   Auth: {}\n",
        if server_config.api_token.is_some() {
            "token"
        } else {
            "off"
        }
    );

    let launcher = Arc::new(ShellLauncher::new(ShellWorkerConfig::from(&server_config)));
    let coordinator = Arc::new(ExecCoordinator::new(exec_config, launcher));

    if server_config.worker_enabled {
        // Keep serving on launch failure: /health reports down, /restart retries.
        if let Err(e) = coordinator.start().await {
            tracing::error!(error = %e, "Worker failed to start");
        }
    } else {
        tracing::warn!("Worker disabled, every submission will be refused");
    }

    let app = routes(Arc::clone(&coordinator), server_config.api_token.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.port)).await?;
    tracing::info!(port = server_config.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    coordinator.shutdown().await;
    Ok(())
}
