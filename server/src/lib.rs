pub mod api;
pub mod error;
mod routes;
pub mod settings;

use std::future::Future;
use std::net::TcpListener;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::FromRef;
use axum::Router;
use downloader::{DownloadManager, Fetcher, YtDlpFetcher};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use settings::SettingManager;

#[derive(Clone, FromRef)]
pub struct ApplicationState {
    pub manager: DownloadManager,
    pub setting_manager: SettingManager,
    /// Cancelled once the server starts shutting down, ends the live event streams.
    pub shutdown: CancellationToken,
}

impl ApplicationState {
    /// Starts the download manager with `fetcher`, must run inside the tokio runtime.
    pub async fn new(setting_manager: SettingManager, fetcher: Arc<dyn Fetcher>) -> Self {
        let config = setting_manager.read().await.manager_config();
        let manager = DownloadManager::new(config, fetcher);
        Self {
            manager,
            setting_manager,
            shutdown: CancellationToken::new(),
        }
    }

    /// Same as [`ApplicationState::new`] with yt-dlp doing the downloads.
    pub async fn with_ytdlp(setting_manager: SettingManager) -> Self {
        let fetcher = {
            let settings = setting_manager.read().await;
            YtDlpFetcher::new(settings.fetcher.clone(), settings.download_dir.clone())
        };
        Self::new(setting_manager, Arc::new(fetcher)).await
    }
}

pub fn app(state: ApplicationState) -> Router {
    Router::new()
        .nest("/api", routes::routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the api on `listener` until `shutdown` resolves, then lets the workers drain the queue.
pub async fn launch_app<F>(
    listener: TcpListener,
    state: ApplicationState,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let manager = state.manager.clone();
    let token = state.shutdown.clone();
    let signal = async move {
        shutdown.await;
        log::info!("Shutdown requested, closing event streams");
        token.cancel();
    };
    let local_addr = listener.local_addr()?;
    let server = axum::Server::from_tcp(listener)
        .with_context(|| format!("Couldn't serve on {}", local_addr))?;
    log::info!("Listening on {}", local_addr);
    server
        .serve(app(state).into_make_service())
        .with_graceful_shutdown(signal)
        .await
        .context("Server error")?;
    manager.shutdown().await;
    log::info!("Server shutdown complete");
    Ok(())
}
