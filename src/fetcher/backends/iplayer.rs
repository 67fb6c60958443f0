// get_iplayer fetcher - BBC iPlayer and BBC Sounds through the get_iplayer binary

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

use crate::fetcher::bridge::{spawn_worker, EventEmitter, EventStream, DEFAULT_RECEIVE_TIMEOUT};
use crate::fetcher::errors::FetchError;
use crate::fetcher::finalize;
use crate::fetcher::models::{format_duration, Format, Level, MediaMetadata};
use crate::fetcher::process;
use crate::fetcher::traits::Fetcher;

pub const NAME: &str = "get_iplayer";
pub const PRIORITY: i32 = 10;

const DOMAINS: [&str; 3] = ["bbc.co.uk/iplayer", "bbc.co.uk/sounds", "bbc.co.uk/programmes"];

// get_iplayer refreshes its programme index before answering, which can be slow.
// Still capped at half the receive timeout so the bridge never declares a stall first.
const METADATA_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct IPlayerFetcher {
    binary: String,
    domains: Vec<String>,
    receive_timeout: Duration,
}

impl IPlayerFetcher {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            domains: DOMAINS.iter().map(|d| d.to_string()).collect(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        }
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    fn metadata_timeout(&self) -> Duration {
        METADATA_TIMEOUT.min(self.receive_timeout / 2)
    }

    fn metadata_args(url: &str, output: &Path) -> Vec<String> {
        vec![
            url.to_string(),
            "--metadata-only".to_string(),
            "--metadata=json".to_string(),
            "--overwrite".to_string(),
            format!("--output={}", output.display()),
        ]
    }

    fn download_args(url: &str, directory: &Path, slug: &str) -> Vec<String> {
        vec![
            "-g".to_string(),
            url.to_string(),
            "--force".to_string(),
            "--overwrite".to_string(),
            format!("--file-prefix={}", slug),
            "--radio-quality=high".to_string(),
            "--tv-quality=hd".to_string(),
            format!("--output={}", finalize::temp_dir(directory).display()),
        ]
    }

    /// Ask get_iplayer to dump the programme's metadata file into a scratch
    /// directory and read it back.
    pub async fn get_metadata(&self, url: &str) -> Result<MediaMetadata, FetchError> {
        let scratch = tempfile::TempDir::new()?;

        let output = process::run_output_with_timeout(
            &self.binary,
            Self::metadata_args(url, scratch.path()),
            self.metadata_timeout(),
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<String> = stderr.lines().map(String::from).collect();
            let summary = process::summarize_stderr(&lines);
            return Err(FetchError::from(format!(
                "get_iplayer failed with code {}: {}",
                output.status.code().unwrap_or(1),
                summary
            )));
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(scratch.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            files.push(entry.path());
        }

        let file = match files.len() {
            0 => {
                return Err(FetchError::NoMetadata(
                    "get_iplayer could not find any metadata for the given URL".to_string(),
                ))
            }
            1 => files.remove(0),
            n => {
                return Err(FetchError::AmbiguousQuery(format!(
                    "get_iplayer found {} matching targets for the given URL - please refine.",
                    n
                )))
            }
        };

        let content = tokio::fs::read_to_string(&file).await?;
        let json: Value = serde_json::from_str(&content)?;
        parse_metadata(url, &json)
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
            Ok(metadata) if !metadata.name.is_empty() => emitter.metadata(metadata).await,
            Ok(_) => {}
            Err(e) => emitter.warning(format!("Could not fetch metadata: {}", e)).await,
        }

        if format != Format::VideoAndAudio {
            emitter
                .warning(
                    "get_iplayer does not support the Format function - you will receive media in the same format as the origin.",
                )
                .await;
        }

        finalize::ensure_temp_dir(&directory).await?;
        process::stream_process(
            &self.binary,
            Self::download_args(&url, &directory, &slug),
            &emitter,
            classify_line,
        )
        .await?;

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
impl Fetcher for IPlayerFetcher {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn ready(&self) -> bool {
        process::probe(&self.binary, "-V").await
    }

    fn eligible_domains(&self) -> Option<&[String]> {
        Some(&self.domains)
    }

    async fn service_names(&self) -> Vec<String> {
        vec!["BBC iPlayer".to_string(), "BBC Sounds".to_string()]
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

/// Build metadata from a get_iplayer JSON metadata file
pub fn parse_metadata(url: &str, json: &Value) -> Result<MediaMetadata, FetchError> {
    let brand = json
        .get("brand")
        .ok_or_else(|| FetchError::Parse("brand key not in returned metadata file".to_string()))?;

    // get_iplayer writes a placeholder with its own name when the lookup failed
    if brand.as_str() == Some("get_iplayer") {
        return Err(FetchError::NoMetadata(
            "get_iplayer returned a result, but the response seems to indicate this media does not exist."
                .to_string(),
        ));
    }

    let mut metadata = MediaMetadata::new(url);
    if let Some(title) = json["title"].as_str() {
        metadata.name = title.to_string();
    }
    if let Some(channel) = json["channel"].as_str() {
        metadata.author = channel.to_string();
    }
    metadata.author_url = json["web"].as_str().filter(|s| !s.is_empty()).map(String::from);
    metadata.uploaded_at = json["firstbcast"]
        .as_str()
        .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok());

    let seconds = json["duration"]
        .as_u64()
        .or_else(|| json["duration"].as_str().and_then(|s| s.trim().parse().ok()));
    if let Some(seconds) = seconds {
        metadata.duration = format_duration(seconds);
    }

    if let Some(kind) = json["type"].as_str() {
        metadata.format = kind.to_string();
    }
    metadata.thumbnail_url = json["thumbnail"].as_str().filter(|s| !s.is_empty()).map(String::from);

    Ok(metadata)
}

/// get_iplayer prefixes its lines with the level; unprefixed lines are debug chatter
pub fn classify_line(line: &str) -> Option<(Level, String)> {
    let line = line.trim_end();
    if line.trim().is_empty() {
        return None;
    }

    let (level, message) = if let Some(rest) = line.strip_prefix("ERROR: ") {
        (Level::Error, rest)
    } else if let Some(rest) = line.strip_prefix("WARNING: ") {
        (Level::Warning, rest)
    } else if let Some(rest) = line.strip_prefix("INFO: ") {
        (Level::Info, rest)
    } else {
        (Level::Debug, line.strip_prefix("DEBUG: ").unwrap_or(line))
    };

    Some((level, message.to_string()))
}
