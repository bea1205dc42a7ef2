use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct YtDlpConfig {
    /// yt-dlp executable, looked up on PATH when not absolute
    pub binary: PathBuf,
    /// ffmpeg used for merging, detected when unset
    pub ffmpeg_location: Option<PathBuf>,
    pub output_template: String,
    pub merge_output_format: String,
    pub user_agent: String,
    /// Browser target for `--impersonate`, replaces the user agent header when set
    pub impersonate: Option<String>,
    pub buffer_size: usize,
    pub check_certificates: bool,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        YtDlpConfig {
            binary: PathBuf::from("yt-dlp"),
            ffmpeg_location: None,
            output_template: "%(title)s.%(ext)s".to_owned(),
            merge_output_format: "mp4".to_owned(),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            impersonate: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            check_certificates: false,
        }
    }
}
