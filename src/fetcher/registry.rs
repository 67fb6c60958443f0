// Registered fetchers and candidate selection

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::traits::Fetcher;

/// Upper bound on a single readiness probe, on top of the fetcher's own
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The set of fetchers known to the process.
///
/// Filled once at startup through `add_fetcher`, then shared behind an `Arc`
/// and only read from while serving requests.
pub struct FetcherRegistry {
    fetchers: Vec<Arc<dyn Fetcher>>,
    probe_timeout: Duration,
}

impl FetcherRegistry {
    pub fn new() -> Self {
        Self {
            fetchers: Vec::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn add_fetcher(&mut self, fetcher: Arc<dyn Fetcher>) {
        self.fetchers.push(fetcher);
    }

    /// All fetchers in registration order
    pub fn fetchers(&self) -> &[Arc<dyn Fetcher>] {
        &self.fetchers
    }

    pub fn len(&self) -> usize {
        self.fetchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fetchers.is_empty()
    }

    /// Ready, domain-eligible fetchers for `url`, lowest priority value first.
    ///
    /// Readiness is probed afresh on every call. Ties keep registration order.
    pub async fn candidates(&self, url: &str) -> Vec<Arc<dyn Fetcher>> {
        let eligible: Vec<&Arc<dyn Fetcher>> = self
            .fetchers
            .iter()
            .filter(|f| {
                let ok = f.is_eligible(url);
                if !ok {
                    debug!(fetcher = f.name(), url, "not eligible for url");
                }
                ok
            })
            .collect();

        let probes = eligible.iter().map(|f| self.probe(f));
        let readiness = join_all(probes).await;

        let mut candidates: Vec<Arc<dyn Fetcher>> = eligible
            .into_iter()
            .zip(readiness)
            .filter_map(|(f, ready)| ready.then(|| Arc::clone(f)))
            .collect();

        // Vec::sort_by_key is stable
        candidates.sort_by_key(|f| f.priority());
        candidates
    }

    /// Fetchers paired with their readiness, probing each one exactly once.
    ///
    /// With a URL this is the candidate list, all of which are ready. Without
    /// one it is every registered fetcher in registration order.
    pub async fn readiness(&self, url: Option<&str>) -> Vec<(Arc<dyn Fetcher>, bool)> {
        match url {
            Some(url) => self
                .candidates(url)
                .await
                .into_iter()
                .map(|f| (f, true))
                .collect(),
            None => {
                let probes = self.fetchers.iter().map(|f| self.probe(f));
                let readiness = join_all(probes).await;
                self.fetchers.iter().cloned().zip(readiness).collect()
            }
        }
    }

    async fn probe(&self, fetcher: &Arc<dyn Fetcher>) -> bool {
        match tokio::time::timeout(self.probe_timeout, fetcher.ready()).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(fetcher = fetcher.name(), "not ready, skipping");
                false
            }
            Err(_) => {
                debug!(fetcher = fetcher.name(), "readiness probe timed out, skipping");
                false
            }
        }
    }
}

impl Default for FetcherRegistry {
    fn default() -> Self {
        Self::new()
    }
}
