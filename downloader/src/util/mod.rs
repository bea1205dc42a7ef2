use std::error::Error;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub type TestResult<T> = std::result::Result<T, Box<dyn Error>>;

const PARTIAL_EXTENSIONS: [&str; 3] = ["part", "ytdl", "temp"];

fn is_partial(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| PARTIAL_EXTENSIONS.contains(&ext))
        .unwrap_or(false)
}

/// Returns the most recently modified finished file in `dir` named `stem` with any extension.
/// Partial download artifacts are skipped, a missing or unreadable directory yields None.
pub async fn newest_file(dir: &Path, stem: &OsStr) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if is_partial(&path) || path.file_stem() != Some(stem) {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map_or(true, |(time, _)| modified >= *time) {
            newest = Some((modified, path));
        }
    }
    newest.map(|(_, path)| path)
}
