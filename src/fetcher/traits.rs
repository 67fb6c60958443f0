// Fetcher trait definition

use async_trait::async_trait;
use std::path::Path;

use super::bridge::EventStream;
use super::models::Format;

/// A pluggable backend able to retrieve media for some class of URLs
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Name of the fetcher (for display and logging)
    fn name(&self) -> &str;

    /// Lower values are tried first
    fn priority(&self) -> i32;

    /// Whether the backend can take requests right now.
    ///
    /// Probes configuration and reachability on every call. Must finish in
    /// bounded time and report `false` on any internal error.
    async fn ready(&self) -> bool;

    /// URL substrings this fetcher claims. `None` means any URL (catch-all).
    fn eligible_domains(&self) -> Option<&[String]>;

    /// Friendly names of the services this fetcher supports
    async fn service_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether `url` falls within `eligible_domains`
    fn is_eligible(&self, url: &str) -> bool {
        match self.eligible_domains() {
            None => true,
            Some(domains) => domains.iter().any(|d| url.contains(d.as_str())),
        }
    }

    /// Begin fetching `url` into `directory`, naming the result after `slug`.
    ///
    /// Returns immediately; the work happens on a background task and is
    /// reported through the stream, which always ends with a `finish` report.
    fn fetch(&self, url: &str, format: Format, directory: &Path, slug: &str) -> EventStream;
}
