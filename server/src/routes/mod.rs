use std::convert::Infallible;

use axum::{
    body::StreamBody,
    extract::{multipart::MultipartRejection, Multipart, Path, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use downloader::{DownloadManager, JobId, Snapshot};
use futures::Stream;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::api::QueueRequest;
use crate::error::{ApiError, ApiResult};
use crate::ApplicationState;

async fn queue(State(manager): State<DownloadManager>, body: Bytes) -> ApiResult<Json<Snapshot>> {
    let request: QueueRequest = if body.is_empty() {
        QueueRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {}", e)))?
    };
    Ok(Json(manager.submit(&request.urls)?))
}

/// Accepts a text file with one url per line.
async fn upload(
    State(manager): State<DownloadManager>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<Json<Snapshot>> {
    let mut multipart = multipart.map_err(|_| ApiError::bad_request("No file"))?;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        if field.file_name() == Some("") {
            return Err(ApiError::bad_request("No selected file"));
        }
        let content = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        let content = String::from_utf8_lossy(&content);
        return Ok(Json(manager.submit(content.lines())?));
    }
    Err(ApiError::bad_request("No file"))
}

async fn status(State(manager): State<DownloadManager>) -> Json<Snapshot> {
    Json(manager.snapshot())
}

/// Live snapshots as server-sent events, the first one is the current state.
/// The stream ends when the server shuts down.
async fn events(
    State(manager): State<DownloadManager>,
    State(shutdown): State<CancellationToken>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = manager.subscribe();
    log::info!("Event stream {} opened", subscription.id());
    let stream = async_stream::stream! {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                snapshot = subscription.recv() => snapshot,
            };
            let Some(snapshot) = next else {
                log::info!("Event stream {} closed", subscription.id());
                break;
            };
            yield Ok::<_, Infallible>(Event::default().event("snapshot").data(&*snapshot));
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn attachment_name(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn download(
    State(manager): State<DownloadManager>,
    Path(id): Path<JobId>,
) -> ApiResult<impl IntoResponse> {
    let file = manager.file(id).await?;
    let handle = tokio::fs::File::open(&file.path).await.map_err(|e| {
        ApiError::internal(format!("Couldn't open {}: {}", file.path.display(), e))
    })?;
    log::info!("Serving {} for job {}", file.path.display(), id);
    let headers = [
        (
            header::CONTENT_TYPE,
            "application/octet-stream".to_owned(),
        ),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", attachment_name(&file.filename)),
        ),
    ];
    Ok((headers, StreamBody::new(ReaderStream::new(handle))))
}

async fn clear(State(manager): State<DownloadManager>) -> Json<Snapshot> {
    Json(manager.clear().await)
}

pub fn routes() -> Router<ApplicationState> {
    Router::new()
        .route("/queue", post(queue))
        .route("/upload", post(upload))
        .route("/status", get(status))
        .route("/events", get(events))
        .route("/download/:id", get(download))
        .route("/clear", post(clear))
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn attachment_names_are_header_safe() {
        assert_eq!(attachment_name("My Video.mp4"), "My Video.mp4");
        assert_eq!(attachment_name("a\"b\\c.mp4"), "a_b_c.mp4");
        assert_eq!(attachment_name("clip\u{e9}.mp4"), "clip_.mp4");
    }
}
