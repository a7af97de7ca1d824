use log::info;
use tokio::signal;

use jumpgate::config::JumpgateConfig;
use jumpgate::routes::router;
use jumpgate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = JumpgateConfig::load();
    let listen = config.listen.clone();
    let state = AppState::standalone(config);

    let registry = state.registry.clone();
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    info!("jumpgate listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = signal::ctrl_c().await;
            info!("shutting down, draining sessions");
            shutdown.cancel();
            registry.drain();
        })
        .await?;

    Ok(())
}
