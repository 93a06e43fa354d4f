use crowd_live::{LiveSession, SessionConfig, SyntheticSource};
use crowd_live_dashboard::{ControlHandle, ServerConfig, start_server};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let session_cfg = SessionConfig::from_env()?;
    tracing::info!(endpoint = %session_cfg.endpoint, "analyzer endpoint");
    let cfg = ServerConfig::from_env();

    // No camera on the server side; stream the moving test pattern.
    let control = ControlHandle::new(LiveSession::new(session_cfg), || {
        Box::new(SyntheticSource::new(640, 480))
    });

    let handle = start_server(cfg, control.clone()).await?;
    tokio::select! {
        _ = handle => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            control.stop().await;
        }
    }
    Ok(())
}
