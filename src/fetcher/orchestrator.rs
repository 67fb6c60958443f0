// Orchestrator with fallback logic

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{info, warn};

use super::models::{FetcherEvent, Format};
use super::registry::FetcherRegistry;

/// Why an orchestration ended without media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// No registered fetcher was both ready and eligible; nothing was tried
    NoEligibleFetcher,
    /// Every candidate was tried and failed
    Exhausted,
}

/// What the caller of `orchestrate` sees
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlurpEvent {
    /// About to hand the request to `fetcher`. `attempt` starts at 1.
    Attempt { fetcher: String, attempt: usize },
    /// An event from the active fetcher, passed through untouched
    Relay { fetcher: String, event: FetcherEvent },
    /// The active fetcher finished with a nonzero status; fallback follows
    AttemptFailed {
        fetcher: String,
        status: i32,
        message: String,
    },
    Succeeded { fetcher: String },
    Failed { reason: FailureReason },
}

impl SlurpEvent {
    /// `Succeeded` and `Failed` close the sequence
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded { .. } | Self::Failed { .. })
    }
}

impl fmt::Display for SlurpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempt { fetcher, attempt: 1 } => write!(f, "🛫 Fetching with {}...", fetcher),
            Self::Attempt { fetcher, .. } => write!(f, "🛫 Trying fetch again with {}...", fetcher),
            Self::Relay { fetcher, event } => write!(f, "[{}] {}", fetcher, event),
            Self::AttemptFailed { message, .. } => write!(f, "🛬 Fetcher failed! Reason: {}", message),
            Self::Succeeded { .. } => write!(f, "🥤 Media slurped"),
            Self::Failed {
                reason: FailureReason::NoEligibleFetcher,
            } => write!(
                f,
                "☹️ Slurp failed - no fetchers can handle this request. Check URL?"
            ),
            Self::Failed {
                reason: FailureReason::Exhausted,
            } => write!(f, "☹️ Slurp failed - out of available fetchers."),
        }
    }
}

pub type SlurpStream = Pin<Box<dyn Stream<Item = SlurpEvent> + Send + 'static>>;

/// Picks fetchers for a request and falls back through them in order
pub struct Orchestrator {
    registry: Arc<FetcherRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<FetcherRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &FetcherRegistry {
        &self.registry
    }

    /// Fetch `url` into `directory` as `slug`, trying candidates one at a time.
    ///
    /// Attempts never overlap: one fetcher's stream is drained to its `finish`
    /// before the next fetcher starts. The returned stream always ends with
    /// exactly one terminal event.
    pub fn orchestrate(&self, url: &str, format: Format, directory: &Path, slug: &str) -> SlurpStream {
        let registry = Arc::clone(&self.registry);
        let url = url.to_string();
        let directory = directory.to_path_buf();
        let slug = slug.to_string();

        Box::pin(async_stream::stream! {
            let candidates = registry.candidates(&url).await;
            if candidates.is_empty() {
                warn!(%url, "no eligible fetcher");
                yield SlurpEvent::Failed { reason: FailureReason::NoEligibleFetcher };
                return;
            }

            for (idx, fetcher) in candidates.iter().enumerate() {
                let name = fetcher.name().to_string();
                info!(fetcher = %name, attempt = idx + 1, %url, "trying fetcher");
                yield SlurpEvent::Attempt { fetcher: name.clone(), attempt: idx + 1 };

                let mut events = fetcher.fetch(&url, format, &directory, &slug);
                let mut outcome = None;

                while let Some(event) = events.next().await {
                    let finish = event.as_finish().map(|r| (r.status, r.message.clone()));
                    yield SlurpEvent::Relay { fetcher: name.clone(), event };
                    if finish.is_some() {
                        outcome = finish;
                        break;
                    }
                }

                let (status, message) = outcome.unwrap_or_else(|| {
                    (1, "fetcher ended without reporting an outcome".to_string())
                });

                if status == 0 {
                    info!(fetcher = %name, %url, "media slurped");
                    yield SlurpEvent::Succeeded { fetcher: name };
                    return;
                }

                warn!(fetcher = %name, status, %message, "fetcher failed, falling back");
                yield SlurpEvent::AttemptFailed { fetcher: name, status, message };
            }

            warn!(%url, tried = candidates.len(), "out of fetchers");
            yield SlurpEvent::Failed { reason: FailureReason::Exhausted };
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::bridge::{spawn_worker, EventStream};
    use crate::fetcher::errors::FetchError;
    use crate::fetcher::finalize;
    use crate::fetcher::models::{MediaMetadata, ProgressReport};
    use crate::fetcher::traits::Fetcher;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Clone)]
    enum Behavior {
        Succeed,
        Fail { status: i32, message: &'static str },
        Stall,
    }

    struct Scripted {
        name: &'static str,
        priority: i32,
        domains: Option<Vec<String>>,
        ready: bool,
        behavior: Behavior,
        receive_timeout: Duration,
    }

    impl Scripted {
        fn new(name: &'static str, priority: i32, domains: Option<Vec<&str>>, behavior: Behavior) -> Self {
            Self {
                name,
                priority,
                domains: domains.map(|d| d.into_iter().map(String::from).collect()),
                ready: true,
                behavior,
                receive_timeout: Duration::from_secs(5),
            }
        }
    }

    #[async_trait]
    impl Fetcher for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        async fn ready(&self) -> bool {
            self.ready
        }

        fn eligible_domains(&self) -> Option<&[String]> {
            self.domains.as_deref()
        }

        fn fetch(&self, url: &str, _format: Format, directory: &Path, slug: &str) -> EventStream {
            let behavior = self.behavior.clone();
            let url = url.to_string();
            let directory = directory.to_path_buf();
            let slug = slug.to_string();

            spawn_worker(self.name, self.receive_timeout, move |emitter| async move {
                match behavior {
                    Behavior::Succeed => {
                        emitter.info("starting").await;
                        emitter.metadata(MediaMetadata::new(url)).await;
                        let temp = finalize::ensure_temp_dir(&directory).await?;
                        let staged = temp.join(format!("{}.tmp", slug));
                        tokio::fs::write(&staged, b"media").await?;
                        let dest = finalize::destination(&directory, &slug, "m4a");
                        emitter.info("moving").await;
                        finalize::finalize(&staged, &dest).await
                    }
                    Behavior::Fail { status, message } => {
                        emitter.error(message).await;
                        Err(FetchError::ProcessFailed {
                            program: "scripted".to_string(),
                            code: status,
                            detail: message.to_string(),
                        })
                    }
                    Behavior::Stall => {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Err(FetchError::EmptyTransfer)
                    }
                }
            })
        }
    }

    fn orchestrator(fetchers: Vec<Scripted>) -> Orchestrator {
        let mut registry = FetcherRegistry::new();
        for f in fetchers {
            registry.add_fetcher(Arc::new(f));
        }
        Orchestrator::new(Arc::new(registry))
    }

    async fn run(orch: &Orchestrator, url: &str, dir: &Path, slug: &str) -> Vec<SlurpEvent> {
        orch.orchestrate(url, Format::AudioOnly, dir, slug).collect().await
    }

    fn finish_of(event: &SlurpEvent) -> Option<&ProgressReport> {
        match event {
            SlurpEvent::Relay { event, .. } => event.as_finish(),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_single_fetcher_success() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(vec![Scripted::new(
            "AdapterX",
            10,
            Some(vec!["example.com"]),
            Behavior::Succeed,
        )]);

        let events = run(&orch, "https://example.com/a", dir.path(), "track1").await;

        assert_eq!(
            events[0],
            SlurpEvent::Attempt {
                fetcher: "AdapterX".to_string(),
                attempt: 1
            }
        );
        let metadata = events
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    SlurpEvent::Relay {
                        event: FetcherEvent::MetadataAvailable { .. },
                        ..
                    }
                )
            })
            .count();
        assert!(metadata <= 1);

        let finishes: Vec<_> = events.iter().filter_map(finish_of).collect();
        assert_eq!(finishes.len(), 1);
        assert_eq!(finishes[0].status, 0);

        assert_eq!(
            events.last(),
            Some(&SlurpEvent::Succeeded {
                fetcher: "AdapterX".to_string()
            })
        );
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        assert!(dir.path().join("track1.m4a").exists());
        assert!(!dir.path().join("temp").join("track1.tmp").exists());
    }

    #[tokio::test]
    async fn test_falls_back_to_catch_all() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(vec![
            Scripted::new("AdapterY", 1000, None, Behavior::Succeed),
            Scripted::new(
                "AdapterX",
                10,
                Some(vec!["example.com"]),
                Behavior::Fail {
                    status: 2,
                    message: "boom",
                },
            ),
        ]);

        let events = run(&orch, "https://example.com/a", dir.path(), "track1").await;

        let attempts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SlurpEvent::Attempt { fetcher, attempt } => Some((fetcher.as_str(), *attempt)),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![("AdapterX", 1), ("AdapterY", 2)]);

        let failure = events
            .iter()
            .find_map(|e| match e {
                SlurpEvent::AttemptFailed { status, message, .. } => Some((*status, message.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(failure.0, 2);
        assert!(failure.1.contains("boom"));

        assert_eq!(
            events.last(),
            Some(&SlurpEvent::Succeeded {
                fetcher: "AdapterY".to_string()
            })
        );
        assert!(events
            .iter()
            .any(|e| e.to_string().starts_with("🛫 Trying fetch again with AdapterY")));
    }

    #[tokio::test]
    async fn test_no_eligible_fetcher() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(vec![Scripted::new(
            "AdapterX",
            10,
            Some(vec!["other.com"]),
            Behavior::Succeed,
        )]);

        let events = run(&orch, "https://example.com/a", dir.path(), "track1").await;

        assert_eq!(
            events,
            vec![SlurpEvent::Failed {
                reason: FailureReason::NoEligibleFetcher
            }]
        );
    }

    #[tokio::test]
    async fn test_unready_fetchers_mean_no_candidates() {
        let dir = TempDir::new().unwrap();
        let mut x = Scripted::new("AdapterX", 10, Some(vec!["example.com"]), Behavior::Succeed);
        x.ready = false;
        let mut y = Scripted::new("AdapterY", 1000, None, Behavior::Succeed);
        y.ready = false;
        let orch = orchestrator(vec![x, y]);

        let events = run(&orch, "https://example.com/a", dir.path(), "track1").await;

        assert_eq!(
            events,
            vec![SlurpEvent::Failed {
                reason: FailureReason::NoEligibleFetcher
            }]
        );
    }

    #[tokio::test]
    async fn test_stalled_worker_exhausts() {
        let dir = TempDir::new().unwrap();
        let mut x = Scripted::new("AdapterX", 10, None, Behavior::Stall);
        x.receive_timeout = Duration::from_millis(50);
        let orch = orchestrator(vec![x]);

        let events = run(&orch, "https://example.com/a", dir.path(), "track1").await;

        let finishes: Vec<_> = events.iter().filter_map(finish_of).collect();
        assert_eq!(finishes.len(), 1);
        assert_ne!(finishes[0].status, 0);
        assert!(finishes[0].message.contains("stalled"));

        assert!(matches!(events[events.len() - 2], SlurpEvent::AttemptFailed { .. }));
        assert_eq!(
            events.last(),
            Some(&SlurpEvent::Failed {
                reason: FailureReason::Exhausted
            })
        );
    }

    #[tokio::test]
    async fn test_all_failures_exhaust_in_priority_order() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(vec![
            Scripted::new("late", 50, None, Behavior::Fail { status: 1, message: "no" }),
            Scripted::new("early", 5, None, Behavior::Fail { status: 3, message: "nope" }),
        ]);

        let events = run(&orch, "https://example.com/a", dir.path(), "track1").await;

        let failed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SlurpEvent::AttemptFailed { fetcher, status, .. } => Some((fetcher.as_str(), *status)),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![("early", 3), ("late", 1)]);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(!dir.path().join("track1.m4a").exists());
    }

    #[tokio::test]
    async fn test_repeat_runs_are_identical() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(vec![
            Scripted::new("AdapterX", 10, Some(vec!["example.com"]), Behavior::Fail { status: 2, message: "boom" }),
            Scripted::new("AdapterY", 1000, None, Behavior::Succeed),
        ]);

        let first = run(&orch, "https://example.com/a", dir.path(), "track1").await;
        let second = run(&orch, "https://example.com/a", dir.path(), "track1").await;

        assert_eq!(first, second);
    }
}
