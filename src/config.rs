// Configuration - defaults, config.toml, then SLURP_* environment overrides

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::fetcher::backends::{CobaltFetcher, IPlayerFetcher, YtDlpFetcher};
use crate::fetcher::FetcherRegistry;

pub const ENV_PREFIX: &str = "SLURP_";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },

    #[error("output directory {} is not in OUTPUTS", .0.display())]
    OutputNotAllowed(PathBuf),

    #[error("no output directories configured")]
    NoOutputs,

    #[error("no fetchers are enabled and usable")]
    NoFetchers,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Settings {
    /// Allowed destination directories
    #[serde(deserialize_with = "deserialize_outputs")]
    pub outputs: Vec<PathBuf>,

    pub fetcher_ytdlp_enabled: bool,
    pub fetcher_ytdlp_binary: String,
    /// Passed to yt-dlp as `--js-runtimes`, e.g. `deno` or `node:/usr/bin/node`
    pub fetcher_ytdlp_js_runtimes: Option<Vec<String>>,

    /// get_iplayer is installed separately; we only call the binary
    pub fetcher_bbc_iplayer_enabled: bool,
    pub fetcher_bbc_iplayer_binary: String,

    pub fetcher_cobalt_enabled: bool,
    /// Instance URL, with trailing slash
    pub fetcher_cobalt_url: String,
    /// Empty means an unauthenticated connection
    pub fetcher_cobalt_key: String,

    /// HTTP or SOCKS5 proxy for outbound fetches
    pub proxy: Option<String>,

    pub receive_timeout_secs: u64,
    pub probe_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            outputs: vec![PathBuf::from("/tmp/slurp")],
            fetcher_ytdlp_enabled: true,
            fetcher_ytdlp_binary: "yt-dlp".to_string(),
            fetcher_ytdlp_js_runtimes: None,
            fetcher_bbc_iplayer_enabled: false,
            fetcher_bbc_iplayer_binary: "get_iplayer".to_string(),
            fetcher_cobalt_enabled: false,
            fetcher_cobalt_url: "http://localhost:9000/".to_string(),
            fetcher_cobalt_key: String::new(),
            proxy: None,
            receive_timeout_secs: 300,
            probe_timeout_secs: 5,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("outputs", &self.outputs)
            .field("fetcher_ytdlp_enabled", &self.fetcher_ytdlp_enabled)
            .field("fetcher_ytdlp_binary", &self.fetcher_ytdlp_binary)
            .field("fetcher_ytdlp_js_runtimes", &self.fetcher_ytdlp_js_runtimes)
            .field("fetcher_bbc_iplayer_enabled", &self.fetcher_bbc_iplayer_enabled)
            .field("fetcher_bbc_iplayer_binary", &self.fetcher_bbc_iplayer_binary)
            .field("fetcher_cobalt_enabled", &self.fetcher_cobalt_enabled)
            .field("fetcher_cobalt_url", &self.fetcher_cobalt_url)
            .field(
                "fetcher_cobalt_key",
                &if self.fetcher_cobalt_key.is_empty() { "" } else { "***REDACTED***" },
            )
            .field("proxy", &self.proxy)
            .field("receive_timeout_secs", &self.receive_timeout_secs)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Outputs {
    List(Vec<PathBuf>),
    Joined(String),
}

/// OUTPUTS may be a list or a single string joined with the OS path separator
fn deserialize_outputs<'de, D>(deserializer: D) -> Result<Vec<PathBuf>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Outputs::deserialize(deserializer)? {
        Outputs::List(list) => list,
        Outputs::Joined(joined) => split_outputs(&joined),
    })
}

fn split_outputs(joined: &str) -> Vec<PathBuf> {
    std::env::split_paths(joined)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64, ConfigError> {
    let secs = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        key: key.to_string(),
        value: value.to_string(),
    })?;
    nonzero_secs(key, secs)
}

/// A zero timeout would fail every fetch before it starts
fn nonzero_secs(key: &str, secs: u64) -> Result<u64, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: secs.to_string(),
        });
    }
    Ok(secs)
}

impl Settings {
    /// Defaults, then the first config file found, then environment overrides
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match Self::locate(explicit) {
            Some(path) => {
                info!(path = %path.display(), "loading configuration");
                Self::from_file(&path)?
            }
            None => {
                debug!("no config file found, using defaults");
                Self::default()
            }
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// `--config` if given, else ./config.toml, else the per-user config dir
    fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Some(local);
        }

        dirs::config_dir()
            .map(|dir| dir.join("slurp").join(CONFIG_FILE_NAME))
            .filter(|path| path.is_file())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        nonzero_secs("RECEIVE_TIMEOUT_SECS", settings.receive_timeout_secs)?;
        nonzero_secs("PROBE_TIMEOUT_SECS", settings.probe_timeout_secs)?;
        Ok(settings)
    }

    /// Apply `SLURP_<KEY>` values found through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, v)) = get("OUTPUTS") {
            self.outputs = split_outputs(&v);
        }
        if let Some((k, v)) = get("FETCHER_YTDLP_ENABLED") {
            self.fetcher_ytdlp_enabled = parse_bool(&k, &v)?;
        }
        if let Some((_, v)) = get("FETCHER_YTDLP_BINARY") {
            self.fetcher_ytdlp_binary = v;
        }
        if let Some((_, v)) = get("FETCHER_YTDLP_JS_RUNTIMES") {
            let runtimes: Vec<String> = v
                .split(',')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
            self.fetcher_ytdlp_js_runtimes = Some(runtimes);
        }
        if let Some((k, v)) = get("FETCHER_BBC_IPLAYER_ENABLED") {
            self.fetcher_bbc_iplayer_enabled = parse_bool(&k, &v)?;
        }
        if let Some((_, v)) = get("FETCHER_BBC_IPLAYER_BINARY") {
            self.fetcher_bbc_iplayer_binary = v;
        }
        if let Some((k, v)) = get("FETCHER_COBALT_ENABLED") {
            self.fetcher_cobalt_enabled = parse_bool(&k, &v)?;
        }
        if let Some((_, v)) = get("FETCHER_COBALT_URL") {
            self.fetcher_cobalt_url = v;
        }
        if let Some((_, v)) = get("FETCHER_COBALT_KEY") {
            self.fetcher_cobalt_key = v;
        }
        if let Some((_, v)) = get("PROXY") {
            self.proxy = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some((k, v)) = get("RECEIVE_TIMEOUT_SECS") {
            self.receive_timeout_secs = parse_secs(&k, &v)?;
        }
        if let Some((k, v)) = get("PROBE_TIMEOUT_SECS") {
            self.probe_timeout_secs = parse_secs(&k, &v)?;
        }

        Ok(())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Resolve a destination directory against the OUTPUTS allow-list.
    ///
    /// `None` picks the first configured output.
    pub fn output_dir(&self, requested: Option<&Path>) -> Result<PathBuf, ConfigError> {
        match requested {
            None => self.outputs.first().cloned().ok_or(ConfigError::NoOutputs),
            Some(dir) => self
                .outputs
                .iter()
                .find(|allowed| allowed.as_path() == dir)
                .cloned()
                .ok_or_else(|| ConfigError::OutputNotAllowed(dir.to_path_buf())),
        }
    }
}

/// Construct the enabled fetchers, in the order yt-dlp, Cobalt, get_iplayer
pub fn build_registry(settings: &Settings) -> Result<FetcherRegistry, ConfigError> {
    let mut registry = FetcherRegistry::new().with_probe_timeout(settings.probe_timeout());
    let receive_timeout = settings.receive_timeout();

    if settings.fetcher_ytdlp_enabled {
        let runtimes = settings.fetcher_ytdlp_js_runtimes.clone().unwrap_or_else(|| {
            warn!("FETCHER_YTDLP_JS_RUNTIMES is not set; yt-dlp may fail on sites that need a JS runtime");
            Vec::new()
        });
        let fetcher = YtDlpFetcher::new(settings.fetcher_ytdlp_binary.clone())
            .with_js_runtimes(runtimes)
            .with_proxy(settings.proxy.clone())
            .with_receive_timeout(receive_timeout);
        registry.add_fetcher(Arc::new(fetcher));
    }

    if settings.fetcher_cobalt_enabled {
        let built = CobaltFetcher::new(
            settings.fetcher_cobalt_url.clone(),
            settings.fetcher_cobalt_key.clone(),
        )
        .and_then(|f| match &settings.proxy {
            Some(proxy) => f.with_proxy(proxy),
            None => Ok(f),
        });
        match built {
            Ok(fetcher) => {
                let fetcher = fetcher
                    .with_probe_timeout(settings.probe_timeout())
                    .with_receive_timeout(receive_timeout);
                registry.add_fetcher(Arc::new(fetcher));
            }
            Err(e) => error!(fetcher = "cobalt", error = %e, "fetcher misconfigured, skipping"),
        }
    }

    if settings.fetcher_bbc_iplayer_enabled {
        let fetcher = IPlayerFetcher::new(settings.fetcher_bbc_iplayer_binary.clone())
            .with_receive_timeout(receive_timeout);
        registry.add_fetcher(Arc::new(fetcher));
    }

    if registry.is_empty() {
        return Err(ConfigError::NoFetchers);
    }

    let names: Vec<&str> = registry.fetchers().iter().map(|f| f.name()).collect();
    info!(fetchers = ?names, "fetchers enabled");

    Ok(registry)
}
