use anyhow::Context;
use server::settings::{SettingManager, PORT_ENV};
use server::{launch_app, ApplicationState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let setting_manager = SettingManager::load(None).await?;
    let address = setting_manager
        .read()
        .await
        .listen_address(std::env::var(PORT_ENV).ok().as_deref());
    let listener = std::net::TcpListener::bind(&address)
        .with_context(|| format!("Couldn't bind {}", address))?;
    listener.set_nonblocking(true)?;
    let state = ApplicationState::with_ytdlp(setting_manager).await;
    launch_app(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Received shutdown signal, finishing queued jobs");
}
