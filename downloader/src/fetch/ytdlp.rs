use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::config::YtDlpConfig;
use super::{Error, FetchPhase, FetchProgress, Fetcher, Result};
use crate::util::newest_file;

const PROGRESS_MARKER: &str = "[mediaq]";
const FILE_MARKER: &str = "[mediaq-file]";
const PROGRESS_TEMPLATE: &str = "download:[mediaq] %(progress.status)s %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s";
const FILE_TEMPLATE: &str = "after_move:[mediaq-file] %(filepath)s";

/// What a single line of yt-dlp output means to us.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum OutputLine {
    Progress(FetchProgress),
    File(PathBuf),
    Error(String),
}

fn parse_number(field: &str) -> Option<u64> {
    // estimates are printed as floats, missing values as "NA"
    let value: f64 = field.parse().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value as u64)
    } else {
        None
    }
}

pub(crate) fn parse_line(line: &str) -> Option<OutputLine> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(FILE_MARKER) {
        let path = rest.trim();
        return (!path.is_empty()).then(|| OutputLine::File(PathBuf::from(path)));
    }
    if let Some(rest) = line.strip_prefix(PROGRESS_MARKER) {
        let mut fields = rest.split_whitespace();
        let phase = match fields.next()? {
            "downloading" => FetchPhase::Downloading,
            "finished" => FetchPhase::Finished,
            _ => return None,
        };
        let bytes_done = fields.next().and_then(parse_number).unwrap_or(0);
        let total = fields.next().and_then(parse_number);
        let estimate = fields.next().and_then(parse_number);
        return Some(OutputLine::Progress(FetchProgress {
            phase,
            bytes_done,
            bytes_total: total.or(estimate),
        }));
    }
    if line.starts_with("ERROR:") {
        return Some(OutputLine::Error(line.to_owned()));
    }
    None
}

/// Finds ffmpeg: the configured location, a bundled `ffmpeg/ffmpeg` next to the executable, or
/// whatever is on PATH.
pub fn detect_ffmpeg(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = configured {
        if let Ok(found) = which::which(path) {
            log::info!("Using configured ffmpeg at {}", found.display());
            return Some(found);
        }
        log::warn!("Configured ffmpeg {} not found", path.display());
    }
    let bundled = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("ffmpeg").join("ffmpeg")));
    if let Some(bundled) = bundled.filter(|p| p.is_file()) {
        log::info!("Using bundled ffmpeg at {}", bundled.display());
        return Some(bundled);
    }
    match which::which("ffmpeg") {
        Ok(path) => {
            log::info!("ffmpeg detected at {}", path.display());
            Some(path)
        }
        Err(_) => {
            log::warn!("ffmpeg not found, downloads are limited to single formats without merging");
            None
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    file: Option<PathBuf>,
    last_error: Option<String>,
}

impl RunState {
    fn handle(&mut self, line: &str, progress: &(dyn Fn(FetchProgress) + Send + Sync)) {
        match parse_line(line) {
            Some(OutputLine::Progress(p)) => progress(p),
            Some(OutputLine::File(path)) => self.file = Some(path),
            Some(OutputLine::Error(message)) => self.last_error = Some(message),
            None => log::trace!("yt-dlp: {}", line),
        }
    }
}

/// Fetches media by running yt-dlp as a child process and following its output.
#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    config: YtDlpConfig,
    download_dir: PathBuf,
    ffmpeg: Option<PathBuf>,
}

impl YtDlpFetcher {
    pub fn new(config: YtDlpConfig, download_dir: PathBuf) -> Self {
        let ffmpeg = detect_ffmpeg(config.ffmpeg_location.as_deref());
        Self::with_ffmpeg(config, download_dir, ffmpeg)
    }

    pub fn with_ffmpeg(config: YtDlpConfig, download_dir: PathBuf, ffmpeg: Option<PathBuf>) -> Self {
        Self {
            config,
            download_dir,
            ffmpeg,
        }
    }

    pub(crate) fn args(&self, url: &str) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--newline",
            "--no-colors",
            "--progress",
            "--progress-template",
            PROGRESS_TEMPLATE,
            "--print",
            FILE_TEMPLATE,
            "--restrict-filenames",
            "--windows-filenames",
            "--no-mtime",
            "--continue",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.push("--buffer-size".into());
        args.push(self.config.buffer_size.to_string().into());
        args.push("-o".into());
        args.push(self.download_dir.join(&self.config.output_template).into());
        if !self.config.check_certificates {
            args.push("--no-check-certificates".into());
        }
        match &self.ffmpeg {
            Some(ffmpeg) => {
                args.push("-f".into());
                args.push("bestvideo+bestaudio/best".into());
                args.push("--merge-output-format".into());
                args.push(self.config.merge_output_format.clone().into());
                args.push("--recode-video".into());
                args.push(self.config.merge_output_format.clone().into());
                args.push("--ffmpeg-location".into());
                args.push(ffmpeg.into());
            }
            None => {
                args.push("-f".into());
                args.push("best".into());
            }
        }
        match &self.config.impersonate {
            Some(target) => {
                args.push("--impersonate".into());
                args.push(target.into());
            }
            None => {
                args.push("--add-header".into());
                args.push(format!("User-Agent:{}", self.config.user_agent).into());
            }
        }
        args.push("--".into());
        args.push(url.into());
        args
    }

    /// The file yt-dlp reported, or when that one is gone the newest file sharing its name.
    /// Other workers write into the same directory, so unrelated files are never picked.
    async fn resolve_output(&self, reported: Option<PathBuf>) -> Result<PathBuf> {
        let Some(path) = reported else {
            log::warn!("yt-dlp didn't report an output file");
            return Err(Error::NoOutputFile);
        };
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(tokio::fs::canonicalize(&path).await.unwrap_or(path));
        }
        let Some(stem) = path.file_stem() else {
            return Err(Error::NoOutputFile);
        };
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(self.download_dir.as_path());
        log::warn!(
            "Reported output {} does not exist, looking for another file with its name",
            path.display()
        );
        newest_file(dir, stem).await.ok_or(Error::NoOutputFile)
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        url: &str,
        progress: &(dyn Fn(FetchProgress) + Send + Sync),
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        log::info!("Running {} for {}", self.config.binary.display(), url);
        let mut child = Command::new(&self.config.binary)
            .args(self.args(url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(self.config.binary.clone(), e))?;

        let mut state = RunState::default();
        let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());
        let mut stderr = child.stderr.take().map(|err| BufReader::new(err).lines());
        while stdout.is_some() || stderr.is_some() {
            tokio::select! {
                line = async { stdout.as_mut()?.next_line().await.transpose() }, if stdout.is_some() => {
                    match line {
                        Some(Ok(line)) => state.handle(&line, progress),
                        Some(Err(e)) => {
                            log::warn!("Stopped reading yt-dlp stdout: {}", e);
                            stdout = None;
                        }
                        None => stdout = None,
                    }
                }
                line = async { stderr.as_mut()?.next_line().await.transpose() }, if stderr.is_some() => {
                    match line {
                        Some(Ok(line)) => state.handle(&line, progress),
                        Some(Err(e)) => {
                            log::warn!("Stopped reading yt-dlp stderr: {}", e);
                            stderr = None;
                        }
                        None => stderr = None,
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(match state.last_error {
                Some(message) => Error::Failed(message),
                None => Error::Exited(status),
            });
        }
        self.resolve_output(state.file).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::util::TestResult;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use test_log::test;

    #[test]
    fn parses_progress_lines() {
        assert_eq!(
            parse_line("[mediaq] downloading 1024 4096 NA"),
            Some(OutputLine::Progress(FetchProgress {
                phase: FetchPhase::Downloading,
                bytes_done: 1024,
                bytes_total: Some(4096),
            }))
        );
        assert_eq!(
            parse_line("[mediaq] downloading 10 NA 2000.5"),
            Some(OutputLine::Progress(FetchProgress {
                phase: FetchPhase::Downloading,
                bytes_done: 10,
                bytes_total: Some(2000),
            }))
        );
        assert_eq!(
            parse_line("  [mediaq] finished 4096 4096 NA\n"),
            Some(OutputLine::Progress(FetchProgress {
                phase: FetchPhase::Finished,
                bytes_done: 4096,
                bytes_total: Some(4096),
            }))
        );
        assert_eq!(
            parse_line("[mediaq] downloading NA NA NA"),
            Some(OutputLine::Progress(FetchProgress {
                phase: FetchPhase::Downloading,
                bytes_done: 0,
                bytes_total: None,
            }))
        );
        assert_eq!(parse_line("[mediaq] error 1 2 3"), None);
    }

    #[test]
    fn parses_file_and_error_lines() {
        assert_eq!(
            parse_line("[mediaq-file] /tmp/mediaq/My_Video.mp4"),
            Some(OutputLine::File(PathBuf::from("/tmp/mediaq/My_Video.mp4")))
        );
        assert_eq!(parse_line("[mediaq-file]   "), None);
        assert_eq!(
            parse_line("ERROR: [generic] Unsupported URL: https://example.com"),
            Some(OutputLine::Error(
                "ERROR: [generic] Unsupported URL: https://example.com".to_owned()
            ))
        );
        assert_eq!(parse_line("[youtube] abc: Downloading webpage"), None);
    }

    fn has_pair(args: &[OsString], flag: &str, value: &str) -> bool {
        args.windows(2)
            .any(|pair| pair[0] == OsString::from(flag) && pair[1] == OsString::from(value))
    }

    #[test]
    fn args_merge_with_ffmpeg() {
        let fetcher = YtDlpFetcher::with_ffmpeg(
            YtDlpConfig::default(),
            PathBuf::from("/tmp/mediaq"),
            Some(PathBuf::from("/usr/bin/ffmpeg")),
        );
        let args = fetcher.args("https://example.com/watch?v=1");
        assert!(has_pair(&args, "-f", "bestvideo+bestaudio/best"));
        assert!(has_pair(&args, "--merge-output-format", "mp4"));
        assert!(has_pair(&args, "--ffmpeg-location", "/usr/bin/ffmpeg"));
        assert!(has_pair(&args, "-o", "/tmp/mediaq/%(title)s.%(ext)s"));
        assert!(args.contains(&OsString::from("--no-check-certificates")));
        assert_eq!(
            args.last(),
            Some(&OsString::from("https://example.com/watch?v=1"))
        );
    }

    #[test]
    fn args_single_format_without_ffmpeg() {
        let config = YtDlpConfig {
            impersonate: Some("chrome".to_owned()),
            check_certificates: true,
            ..YtDlpConfig::default()
        };
        let fetcher = YtDlpFetcher::with_ffmpeg(config, PathBuf::from("/tmp/mediaq"), None);
        let args = fetcher.args("https://example.com/v");
        assert!(has_pair(&args, "-f", "best"));
        assert!(has_pair(&args, "--impersonate", "chrome"));
        assert!(!args.contains(&OsString::from("--ffmpeg-location")));
        assert!(!args.contains(&OsString::from("--add-header")));
        assert!(!args.contains(&OsString::from("--no-check-certificates")));
    }

    #[cfg(unix)]
    fn fake_ytdlp(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("fake-yt-dlp");
        std::fs::write(&script, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[cfg(unix)]
    #[test(tokio::test)]
    async fn fetch_reports_progress_and_output_file() -> TestResult<()> {
        let bin_dir = TempDir::new()?;
        let download_dir = TempDir::new()?;
        let script = fake_ytdlp(
            bin_dir.path(),
            r#"while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
dir=$(dirname "$out")
echo "[mediaq] downloading 25 100 NA"
echo "[mediaq] downloading 100 100 NA" >&2
echo "[mediaq] finished 100 100 NA"
echo "payload" > "$dir/clip.mp4"
echo "[mediaq-file] $dir/clip.mp4""#,
        );
        let config = YtDlpConfig {
            binary: script,
            ..YtDlpConfig::default()
        };
        let fetcher = YtDlpFetcher::with_ffmpeg(config, download_dir.path().to_owned(), None);
        let seen = Mutex::new(Vec::new());
        let path = fetcher
            .fetch("https://example.com/v", &|p| seen.lock().unwrap().push(p))
            .await?;
        assert_eq!(path.file_name().unwrap(), "clip.mp4");
        assert!(path.is_absolute());
        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen.last().unwrap().phase, FetchPhase::Finished);
        Ok(())
    }

    #[cfg(unix)]
    #[test(tokio::test)]
    async fn fetch_failure_carries_error_line() -> TestResult<()> {
        let bin_dir = TempDir::new()?;
        let download_dir = TempDir::new()?;
        let script = fake_ytdlp(
            bin_dir.path(),
            r#"echo "ERROR: [generic] Unsupported URL: nope" >&2
exit 1"#,
        );
        let config = YtDlpConfig {
            binary: script,
            ..YtDlpConfig::default()
        };
        let fetcher = YtDlpFetcher::with_ffmpeg(config, download_dir.path().to_owned(), None);
        let err = fetcher.fetch("nope", &|_| {}).await.unwrap_err();
        assert_eq!(err.to_string(), "ERROR: [generic] Unsupported URL: nope");
        Ok(())
    }

    #[cfg(unix)]
    #[test(tokio::test)]
    async fn renamed_output_is_found_by_name_only() -> TestResult<()> {
        let bin_dir = TempDir::new()?;
        let download_dir = TempDir::new()?;
        let script = fake_ytdlp(
            bin_dir.path(),
            r#"while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
dir=$(dirname "$out")
echo "payload" > "$dir/clip.mp4"
sleep 0.1
echo "other job" > "$dir/unrelated.mp4"
echo "[mediaq-file] $dir/clip.webm""#,
        );
        let config = YtDlpConfig {
            binary: script,
            ..YtDlpConfig::default()
        };
        let fetcher = YtDlpFetcher::with_ffmpeg(config, download_dir.path().to_owned(), None);
        let path = fetcher.fetch("https://example.com/v", &|_| {}).await?;
        assert_eq!(path.file_name().unwrap(), "clip.mp4");
        Ok(())
    }

    #[cfg(unix)]
    #[test(tokio::test)]
    async fn unreported_output_is_not_guessed() -> TestResult<()> {
        let bin_dir = TempDir::new()?;
        let download_dir = TempDir::new()?;
        tokio::fs::write(download_dir.path().join("unrelated.mp4"), b"other job").await?;
        let script = fake_ytdlp(bin_dir.path(), "exit 0");
        let config = YtDlpConfig {
            binary: script,
            ..YtDlpConfig::default()
        };
        let fetcher = YtDlpFetcher::with_ffmpeg(config, download_dir.path().to_owned(), None);
        let err = fetcher.fetch("https://example.com/v", &|_| {}).await.unwrap_err();
        assert!(matches!(err, Error::NoOutputFile), "unexpected error: {err}");
        Ok(())
    }

    #[test(tokio::test)]
    async fn missing_binary_is_a_spawn_error() {
        let download_dir = TempDir::new().unwrap();
        let config = YtDlpConfig {
            binary: PathBuf::from("/definitely/not/yt-dlp"),
            ..YtDlpConfig::default()
        };
        let fetcher = YtDlpFetcher::with_ffmpeg(config, download_dir.path().to_owned(), None);
        let err = fetcher.fetch("https://example.com", &|_| {}).await.unwrap_err();
        assert!(matches!(err, Error::Spawn(..)), "unexpected error: {err}");
    }
}
