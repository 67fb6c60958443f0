// Cobalt fetcher - asks a Cobalt instance for a media URL and streams it to disk
//
// Cobalt handles far more services than the other backends but with less
// control over quality, so it sits at the back of the queue and claims any URL.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::fetcher::bridge::{spawn_worker, EventEmitter, EventStream, DEFAULT_RECEIVE_TIMEOUT};
use crate::fetcher::errors::FetchError;
use crate::fetcher::finalize;
use crate::fetcher::models::Format;
use crate::fetcher::registry::DEFAULT_PROBE_TIMEOUT;
use crate::fetcher::traits::Fetcher;

pub const NAME: &str = "cobalt";
pub const PRIORITY: i32 = 1000;

const USER_AGENT: &str = concat!("slurp/", env!("CARGO_PKG_VERSION"));

// Emit a progress line each time this many more bytes have landed
const PROGRESS_STEP: u64 = 8 * 1024 * 1024;

/// Body of a Cobalt API answer. Only the fields we act on.
#[derive(Debug, Clone, Deserialize)]
pub struct CobaltResponse {
    pub status: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub error: Option<CobaltErrorBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CobaltErrorBody {
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CobaltFetcher {
    url: String,
    key: Option<String>,
    client: reqwest::Client,
    probe_timeout: Duration,
    receive_timeout: Duration,
}

impl CobaltFetcher {
    /// `url` is the instance root; an empty `key` means unauthenticated
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Result<Self, FetchError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(FetchError::Misconfigured("cobalt instance URL is empty".to_string()));
        }

        let key = key.into();
        let key = if key.is_empty() { None } else { Some(key) };

        Ok(Self {
            url,
            key,
            client: build_client(None)?,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
        })
    }

    /// Route all traffic through `proxy` (`http://`, `https://` or `socks5://`)
    pub fn with_proxy(mut self, proxy: &str) -> Result<Self, FetchError> {
        self.client = build_client(Some(proxy))?;
        Ok(self)
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    fn api_request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, &self.url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json");
        match &self.key {
            Some(key) => request.header("Authorization", format!("Api-Key {}", key)),
            None => request,
        }
    }

    /// Instance information served at the API root
    async fn instance_info(&self) -> Result<Value, FetchError> {
        let response = self
            .api_request(reqwest::Method::GET)
            .timeout(self.probe_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn request_media(&self, url: &str, format: Format) -> Result<CobaltResponse, FetchError> {
        let response = self
            .api_request(reqwest::Method::POST)
            .json(&request_body(url, format))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            // Cobalt explains most refusals in a JSON body; fall back to the raw text.
            let message = serde_json::from_str::<CobaltResponse>(&text)
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.code)
                .unwrap_or_else(|| text.chars().take(200).collect());
            return Err(FetchError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: CobaltResponse = serde_json::from_str(&text)?;
        Ok(parsed)
    }

    /// Stream `media_url` into `target`, returning the number of bytes written
    async fn download(&self, emitter: &EventEmitter, media_url: &str, target: &Path) -> Result<u64, FetchError> {
        let response = self.client.get(media_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                message: format!("media download refused for {}", media_url),
            });
        }

        let estimated = response
            .headers()
            .get("estimated-content-length")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let message = match (response.content_length(), estimated) {
            (Some(size), _) => format!("Downloading media: size {}B", size),
            (None, Some(size)) => format!("Downloading media: APPROXIMATE size {}B", size),
            (None, None) => "Downloading file...".to_string(),
        };
        emitter.info(message).await;

        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        let mut next_report = PROGRESS_STEP;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if written >= next_report {
                emitter.debug(format!("written {} bytes", written)).await;
                next_report = written + PROGRESS_STEP;
            }
        }
        file.flush().await?;

        emitter
            .info(format!("cobalt download complete - size {}B", written))
            .await;
        Ok(written)
    }

    async fn run(
        self,
        emitter: EventEmitter,
        url: String,
        format: Format,
        directory: PathBuf,
        slug: String,
    ) -> Result<PathBuf, FetchError> {
        let answer = self.request_media(&url, format).await?;

        let (media_url, filename) = match answer.status.as_str() {
            "tunnel" | "redirect" => match (answer.url, answer.filename) {
                (Some(u), Some(f)) => (u, f),
                _ => {
                    return Err(FetchError::UnexpectedResponse(
                        "cobalt response is missing url or filename".to_string(),
                    ))
                }
            },
            "error" => {
                let code = answer
                    .error
                    .and_then(|e| e.code)
                    .unwrap_or_else(|| "Unknown Error".to_string());
                return Err(FetchError::UnexpectedResponse(format!("cobalt reported {}", code)));
            }
            "picker" => {
                return Err(FetchError::UnexpectedResponse(
                    "cobalt offered a picker; multi-item posts are not supported".to_string(),
                ))
            }
            other => {
                return Err(FetchError::UnexpectedResponse(format!(
                    "unknown cobalt status '{}'",
                    other
                )))
            }
        };

        let origin = if answer.status == "tunnel" { "remux" } else { "origin" };
        emitter
            .info(format!(
                "Received {} - fetching {} from {}...",
                capitalize(&answer.status),
                filename,
                origin
            ))
            .await;

        let extension = Path::new(&filename)
            .extension()
            .map(|e| e.to_string_lossy().to_string())
            .unwrap_or_default();

        let temp = finalize::ensure_temp_dir(&directory).await?;
        // Hidden and suffixed so other backends sharing temp/ never mistake it for output
        let target = temp.join(format!(".{}.cobalt.tmp", slug));

        let written = self.download(&emitter, &media_url, &target).await?;
        if written == 0 {
            let _ = tokio::fs::remove_file(&target).await;
            return Err(FetchError::EmptyTransfer);
        }

        let destination = finalize::destination(&directory, &slug, &extension);
        emitter
            .info(format!(
                "Moving file from temporary directory to {}",
                destination.display()
            ))
            .await;
        finalize::finalize(&target, &destination).await
    }
}

#[async_trait]
impl Fetcher for CobaltFetcher {
    fn name(&self) -> &str {
        NAME
    }

    fn priority(&self) -> i32 {
        PRIORITY
    }

    async fn ready(&self) -> bool {
        match self.instance_info().await {
            Ok(info) => info.get("cobalt").is_some(),
            Err(e) => {
                debug!(fetcher = NAME, error = %e, "instance not reachable");
                false
            }
        }
    }

    fn eligible_domains(&self) -> Option<&[String]> {
        None
    }

    async fn service_names(&self) -> Vec<String> {
        match self.instance_info().await {
            Ok(info) => info["cobalt"]["services"]
                .as_array()
                .map(|services| {
                    services
                        .iter()
                        .filter_map(|s| s.as_str())
                        .map(capitalize)
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) => {
                debug!(fetcher = NAME, error = %e, "could not list services");
                Vec::new()
            }
        }
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

fn build_client(proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(proxy) = proxy {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| FetchError::Misconfigured(format!("invalid proxy {}: {}", proxy, e)))?;
        builder = builder.proxy(proxy);
    }
    builder
        .build()
        .map_err(|e| FetchError::Misconfigured(format!("cannot build HTTP client: {}", e)))
}

/// JSON body for a media request
pub fn request_body(url: &str, format: Format) -> Value {
    let mut body = json!({
        "url": url,
        "filenameStyle": "basic",
    });

    let extra = match format {
        Format::VideoAndAudio => json!({
            "downloadMode": "auto",
            "videoQuality": "max",
            "audioBitrate": "320",
            "audioFormat": "best",
        }),
        Format::AudioOnly => json!({
            "downloadMode": "audio",
            "audioBitrate": "320",
            "audioFormat": "best",
        }),
        Format::VideoOnly => json!({
            "downloadMode": "mute",
            "videoQuality": "max",
        }),
    };

    if let (Some(body), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
        body.extend(extra.clone());
    }
    body
}

/// "youtube" -> "Youtube"
fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
