// yt-dlp fetcher - runs the yt-dlp binary as a child process

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::fetcher::bridge::{spawn_worker, EventEmitter, EventStream, DEFAULT_RECEIVE_TIMEOUT};
use crate::fetcher::diagnostics;
use crate::fetcher::errors::FetchError;
use crate::fetcher::finalize;
use crate::fetcher::models::{format_duration, Format, Level, MediaMetadata};
use crate::fetcher::process;
use crate::fetcher::traits::Fetcher;

pub const NAME: &str = "yt-dlp";
pub const PRIORITY: i32 = 100;

const DOMAINS: [&str; 6] = [
    "youtube.com",
    "youtu.be",
    "music.youtube.com",
    "soundcloud.com",
    "vimeo.com",
    "bandcamp.com",
];

const SERVICES: [&str; 5] = ["YouTube", "YouTube Music", "SoundCloud", "Vimeo", "Bandcamp"];

/// Metadata lookups are a single page fetch; do not let them eat the attempt.
/// Capped further at half the receive timeout, see `metadata_timeout`.
const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct YtDlpFetcher {
    binary: String,
    js_runtimes: Vec<String>,
    proxy: Option<String>,
    domains: Vec<String>,
    receive_timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            js_runtimes: Vec::new(),
            proxy: None,
            domains: DOMAINS.iter().map(|d| d.to_string()).collect(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    /// JS runtimes yt-dlp may use for signature solving, e.g. `deno` or `node:/usr/bin/node`
    pub fn with_js_runtimes(mut self, runtimes: Vec<String>) -> Self {
        self.js_runtimes = runtimes;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// The metadata lookup sends no events, so it must give up well before the bridge does
    fn metadata_timeout(&self) -> Duration {
        METADATA_TIMEOUT.min(self.receive_timeout / 2)
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for runtime in &self.js_runtimes {
            args.push("--js-runtimes".to_string());
            args.push(runtime.clone());
        }
        if let Some(proxy) = &self.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        args
    }

    fn metadata_args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--dump-json".to_string(), "--no-playlist".to_string()];
        args.extend(self.common_args());
        args.push(url.to_string());
        args
    }

    fn download_args(&self, url: &str, format: Format, directory: &Path, slug: &str) -> Vec<String> {
        let mut args = vec![
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "-P".to_string(),
            finalize::temp_dir(directory).to_string_lossy().to_string(),
            "-o".to_string(),
            format!("{}.%(ext)s", slug),
        ];
        args.extend(format_selection(format).iter().map(|a| a.to_string()));
        args.extend(self.common_args());
        args.push(url.to_string());
        args
    }

    async fn get_metadata(&self, url: &str) -> Result<MediaMetadata, FetchError> {
        let output =
            process::run_output_with_timeout(&self.binary, self.metadata_args(url), self.metadata_timeout())
                .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<String> = stderr.lines().map(String::from).collect();
            return Err(FetchError::ProcessFailed {
                program: self.binary.clone(),
                code: output.status.code().unwrap_or(1),
                detail: process::summarize_stderr(&lines),
            });
        }

        // With --no-playlist there is one JSON document per line; take the first.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| FetchError::NoMetadata("yt-dlp printed no metadata".to_string()))?;
        let json: Value = serde_json::from_str(first)?;

        Ok(parse_metadata(url, &json))
    }

    async fn run(
        self,
        emitter: EventEmitter,
        url: String,
        format: Format,
        directory: PathBuf,
        slug: String,
    ) -> Result<PathBuf, FetchError> {
        match self.get_metadata(&url).await {
            Ok(metadata) => emitter.metadata(metadata).await,
            Err(e) => emitter.warning(format!("Could not fetch metadata: {}", e)).await,
        }

        finalize::ensure_temp_dir(&directory).await?;

        emitter
            .info(format!("Downloading {} as {}", url, format))
            .await;
        process::stream_process(
            &self.binary,
            self.download_args(&url, format, &directory, &slug),
            &emitter,
            classify_line,
        )
        .await
        .map_err(with_diagnosis)?;

        let staged = finalize::find_staged(&directory, &slug).await?;
        let extension = staged
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();
        let destination = finalize::destination(&directory, &slug, &extension);

        emitter
            .info(format!(
                "Moving file from temporary directory to {}",
                destination.display()
            ))
            .await;
        finalize::finalize(&staged, &destination).await
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn ready(&self) -> bool {
        process::probe(&self.binary, "--version").await
    }

    fn eligible_domains(&self) -> Option<&[String]> {
        Some(&self.domains)
    }

    async fn service_names(&self) -> Vec<String> {
        SERVICES.iter().map(|s| s.to_string()).collect()
    }

    fn fetch(&self, url: &str, format: Format, directory: &Path, slug: &str) -> EventStream {
        info!(fetcher = NAME, url, %format, "starting fetch");
        let this = self.clone();
        let (url, directory, slug) = (url.to_string(), directory.to_path_buf(), slug.to_string());
        spawn_worker(NAME, self.receive_timeout, move |emitter| {
            this.run(emitter, url, format, directory, slug)
        })
    }
}

/// yt-dlp format selection for each requested format
pub fn format_selection(format: Format) -> &'static [&'static str] {
    match format {
        Format::VideoAndAudio => &["-f", "bestvideo*+bestaudio/best"],
        Format::VideoOnly => &["-f", "bestvideo"],
        Format::AudioOnly => &["-f", "m4a/bestaudio/best", "-x", "--audio-format", "m4a"],
    }
}

/// Build metadata from a `--dump-json` document
pub fn parse_metadata(url: &str, json: &Value) -> MediaMetadata {
    let mut metadata = MediaMetadata::new(url);

    if let Some(title) = json["title"].as_str() {
        metadata.name = title.to_string();
    }
    if let Some(uploader) = json["uploader"].as_str() {
        metadata.author = uploader.to_string();
    }
    metadata.author_url = json["uploader_url"].as_str().map(String::from);
    metadata.uploaded_at = json["timestamp"]
        .as_i64()
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
    if let Some(duration) = json["duration"].as_f64() {
        metadata.duration = format_duration(duration.max(0.0) as u64);
    }
    if let Some(format) = json["format"].as_str() {
        metadata.format = format.to_string();
    }
    metadata.thumbnail_url = json["thumbnail"].as_str().map(String::from);

    metadata
}

fn with_diagnosis(error: FetchError) -> FetchError {
    match error {
        FetchError::ProcessFailed { program, code, detail } => {
            if detail.is_empty() {
                warn!(program = %program, code, "yt-dlp failed without output");
            }
            FetchError::ProcessFailed {
                program,
                code,
                detail: diagnostics::annotate(&detail),
            }
        }
        other => other,
    }
}

/// Map a yt-dlp output line to a log event, if it is worth reporting
pub fn classify_line(line: &str) -> Option<(Level, String)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if let Some((_, status)) = parse_progress(line) {
        return Some((Level::Info, status));
    }
    if let Some(rest) = line.strip_prefix("ERROR:") {
        return Some((Level::Error, rest.trim().to_string()));
    }
    if let Some(rest) = line.strip_prefix("WARNING:") {
        return Some((Level::Warning, rest.trim().to_string()));
    }

    Some((Level::Debug, line.to_string()))
}

/// Parse yt-dlp progress line like:
/// [download]   6.2% of ~ 343.72MiB at  420.30KiB/s ETA 12:32 (frag 29/454)
/// Returns (percent, status_string)
pub fn parse_progress(line: &str) -> Option<(f32, String)> {
    lazy_static::lazy_static! {
        static ref PROGRESS_RE: Regex = Regex::new(
            r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*\s*\w+)\s+at\s+(\d+\.?\d*\s*\w+/s)(?:\s+ETA\s+(\S+))?(?:\s+\(frag\s+(\d+)/(\d+)\))?"
        ).unwrap();
        static ref DEST_RE: Regex = Regex::new(r"\[download\]\s+Destination:\s+(.+)").unwrap();
        static ref MERGE_RE: Regex = Regex::new(r"\[Merger?\]\s+Merging").unwrap();
        static ref EXTRACT_RE: Regex = Regex::new(r"\[ExtractAudio\]\s+Destination").unwrap();
        static ref ALREADY_RE: Regex = Regex::new(r"has already been downloaded").unwrap();
    }

    if let Some(caps) = PROGRESS_RE.captures(line) {
        let percent: f32 = caps.get(1)?.as_str().parse().ok()?;
        let size = caps.get(2).map(|m| m.as_str()).unwrap_or("?");
        let speed = caps.get(3).map(|m| m.as_str()).unwrap_or("?");
        let eta = caps.get(4).map(|m| m.as_str()).unwrap_or("");
        let frag = caps.get(5).zip(caps.get(6));

        let status = match frag {
            Some((fc, ft)) => format!(
                "⬇️ {:.1}% of {} @ {} ETA {} (frag {}/{})",
                percent,
                size,
                speed,
                eta,
                fc.as_str(),
                ft.as_str()
            ),
            None if !eta.is_empty() => format!("⬇️ {:.1}% of {} @ {} ETA {}", percent, size, speed, eta),
            None => format!("⬇️ {:.1}% of {} @ {}", percent, size, speed),
        };

        return Some((percent, status));
    }

    if let Some(caps) = DEST_RE.captures(line) {
        let filename = caps.get(1).map(|m| m.as_str()).unwrap_or("file");
        let short_name: String = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.to_string())
            .chars()
            .take(50)
            .collect();
        return Some((0.0, format!("📥 Starting: {}...", short_name)));
    }

    if MERGE_RE.is_match(line) {
        return Some((99.0, "🔄 Merging video and audio...".to_string()));
    }

    if EXTRACT_RE.is_match(line) {
        return Some((99.0, "🎵 Extracting audio...".to_string()));
    }

    if ALREADY_RE.is_match(line) {
        return Some((100.0, "✅ File already downloaded".to_string()));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_progress_with_fragments() {
        let line = "[download]   6.2% of ~ 343.72MiB at  420.30KiB/s ETA 12:32 (frag 29/454)";
        let (percent, status) = parse_progress(line).unwrap();
        assert!((percent - 6.2).abs() < f32::EPSILON);
        assert_eq!(status, "⬇️ 6.2% of 343.72MiB @ 420.30KiB/s ETA 12:32 (frag 29/454)");
    }

    #[test]
    fn test_progress_without_fragments() {
        let line = "[download]  50.0% of 10.00MiB at 1.00MiB/s ETA 00:05";
        let (_, status) = parse_progress(line).unwrap();
        assert_eq!(status, "⬇️ 50.0% of 10.00MiB @ 1.00MiB/s ETA 00:05");
    }

    #[test]
    fn test_progress_other_lines() {
        assert_eq!(
            parse_progress("[download] Destination: /tmp/slurp/temp/my-slug.mp4").unwrap().1,
            "📥 Starting: my-slug.mp4..."
        );
        assert_eq!(parse_progress("[Merger] Merging formats into \"x.mkv\"").unwrap().0, 99.0);
        assert!(parse_progress("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn test_classify_levels() {
        assert_eq!(
            classify_line("ERROR: [youtube] abc: Video unavailable"),
            Some((Level::Error, "[youtube] abc: Video unavailable".to_string()))
        );
        assert_eq!(
            classify_line("WARNING: falling back"),
            Some((Level::Warning, "falling back".to_string()))
        );
        assert_eq!(classify_line("[info] abc: Downloading 1 format(s)").map(|c| c.0), Some(Level::Debug));
        assert_eq!(classify_line("   "), None);
    }

    #[test]
    fn test_format_mapping() {
        assert_eq!(format_selection(Format::VideoAndAudio), &["-f", "bestvideo*+bestaudio/best"]);
        assert_eq!(format_selection(Format::VideoOnly), &["-f", "bestvideo"]);
        assert!(format_selection(Format::AudioOnly).contains(&"-x"));
    }

    #[test]
    fn test_download_args() {
        let fetcher = YtDlpFetcher::new("yt-dlp")
            .with_js_runtimes(vec!["deno".to_string()])
            .with_proxy(Some("socks5://127.0.0.1:1080".to_string()));
        let args = fetcher.download_args(
            "https://youtu.be/abc",
            Format::AudioOnly,
            Path::new("/tmp/slurp"),
            "my-slug",
        );

        let staging = Path::new("/tmp/slurp").join("temp").to_string_lossy().to_string();
        let p = args.iter().position(|a| a == "-P").unwrap();
        assert_eq!(args[p + 1], staging);
        let o = args.iter().position(|a| a == "-o").unwrap();
        assert_eq!(args[o + 1], "my-slug.%(ext)s");
        assert!(args.windows(2).any(|w| w[0] == "--js-runtimes" && w[1] == "deno"));
        assert!(args.windows(2).any(|w| w[0] == "--proxy" && w[1] == "socks5://127.0.0.1:1080"));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
    }

    #[test]
    fn test_parse_metadata() {
        let doc = json!({
            "title": "Lawn Mowers",
            "uploader": "Someone",
            "uploader_url": "https://www.youtube.com/@someone",
            "timestamp": 1700000000,
            "duration": 3725.0,
            "format": "137 - 1920x1080",
            "thumbnail": "https://i.ytimg.com/vi/abc/hq.jpg"
        });
        let metadata = parse_metadata("https://youtu.be/abc", &doc);
        assert_eq!(metadata.name, "Lawn Mowers");
        assert_eq!(metadata.author, "Someone");
        assert_eq!(metadata.duration, "1 hour 2 minutes 5 seconds");
        assert_eq!(metadata.uploaded_at.map(|t| t.unix_timestamp()), Some(1700000000));
        assert_eq!(metadata.thumbnail_url.as_deref(), Some("https://i.ytimg.com/vi/abc/hq.jpg"));
    }

    #[test]
    fn test_parse_metadata_missing_fields() {
        let metadata = parse_metadata("https://youtu.be/abc", &json!({}));
        assert_eq!(metadata.name, MediaMetadata::UNKNOWN_NAME);
        assert_eq!(metadata.duration, MediaMetadata::UNKNOWN_DURATION);
        assert!(metadata.uploaded_at.is_none());
    }

    #[test]
    fn test_eligibility() {
        let fetcher = YtDlpFetcher::new("yt-dlp");
        assert!(fetcher.is_eligible("https://www.youtube.com/watch?v=abc"));
        assert!(fetcher.is_eligible("https://soundcloud.com/artist/track"));
        assert!(!fetcher.is_eligible("https://www.bbc.co.uk/iplayer/episode/p0hbq90v"));
    }

    #[tokio::test]
    async fn test_missing_binary_not_ready() {
        let fetcher = YtDlpFetcher::new("definitely-not-yt-dlp-9c1e");
        assert!(!fetcher.ready().await);
    }

    #[test]
    fn test_metadata_timeout_stays_under_receive_timeout() {
        let fetcher = YtDlpFetcher::new("yt-dlp");
        assert_eq!(fetcher.metadata_timeout(), METADATA_TIMEOUT);

        let fetcher = fetcher.with_receive_timeout(Duration::from_secs(10));
        assert_eq!(fetcher.metadata_timeout(), Duration::from_secs(5));
    }

    /// A stand-in yt-dlp that answers `--dump-json` after `metadata_delay`
    /// seconds and otherwise writes `<slug>.mp4` into the `-P` directory
    #[cfg(unix)]
    fn fake_binary(dir: &Path, metadata_delay: u32) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-yt-dlp");
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
if [ "$1" = "--dump-json" ]; then
  sleep {delay}
  echo '{{"title":"Fake","uploader":"Tester","duration":65}}'
  exit 0
fi
while [ $# -gt 0 ]; do
  case "$1" in
    -P) dir="$2"; shift ;;
    -o) out="$2"; shift ;;
  esac
  shift
done
name=$(echo "$out" | sed 's/%(ext)s/mp4/')
echo "[download]  50.0% of 10.00MiB at 1.00MiB/s ETA 00:05"
echo media > "$dir/$name"
"#,
                delay = metadata_delay
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_with_fake_binary() {
        use futures::StreamExt;

        let bin_dir = tempfile::TempDir::new().unwrap();
        let out_dir = tempfile::TempDir::new().unwrap();

        let fetcher = YtDlpFetcher::new(fake_binary(bin_dir.path(), 0));
        let events: Vec<_> = fetcher
            .fetch("https://youtu.be/abc", Format::VideoAndAudio, out_dir.path(), "clip")
            .collect()
            .await;

        let finish = events.last().and_then(|e| e.as_finish()).unwrap();
        assert_eq!(finish.status, 0, "unexpected finish: {}", finish.message);
        assert!(out_dir.path().join("clip.mp4").exists());
        assert!(!out_dir.path().join("temp").join("clip.mp4").exists());
        assert!(events.iter().any(|e| e.to_string().contains("Fake by Tester")));
        assert!(events.iter().any(|e| e.to_string().contains("⬇️ 50.0%")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_ignores_leftover_cobalt_partial() {
        use futures::StreamExt;

        let bin_dir = tempfile::TempDir::new().unwrap();
        let out_dir = tempfile::TempDir::new().unwrap();
        // An interrupted Cobalt transfer for the same slug, old and new naming
        let temp = finalize::ensure_temp_dir(out_dir.path()).await.unwrap();
        std::fs::write(temp.join("clip.tmp"), b"half").unwrap();
        std::fs::write(temp.join(".clip.cobalt.tmp"), b"half").unwrap();

        let fetcher = YtDlpFetcher::new(fake_binary(bin_dir.path(), 0));
        let events: Vec<_> = fetcher
            .fetch("https://youtu.be/abc", Format::VideoAndAudio, out_dir.path(), "clip")
            .collect()
            .await;

        let finish = events.last().and_then(|e| e.as_finish()).unwrap();
        assert_eq!(finish.status, 0, "unexpected finish: {}", finish.message);
        assert_eq!(std::fs::read(out_dir.path().join("clip.mp4")).unwrap(), b"media\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_metadata_does_not_stall_download() {
        use futures::StreamExt;

        let bin_dir = tempfile::TempDir::new().unwrap();
        let out_dir = tempfile::TempDir::new().unwrap();

        let fetcher = YtDlpFetcher::new(fake_binary(bin_dir.path(), 3))
            .with_receive_timeout(Duration::from_secs(1));
        let events: Vec<_> = fetcher
            .fetch("https://youtu.be/abc", Format::VideoAndAudio, out_dir.path(), "clip")
            .collect()
            .await;

        let finish = events.last().and_then(|e| e.as_finish()).unwrap();
        assert_eq!(finish.status, 0, "unexpected finish: {}", finish.message);
        assert!(events.iter().any(|e| e.to_string().contains("Could not fetch metadata")));
        assert!(out_dir.path().join("clip.mp4").exists());
    }
}
