// Producer/consumer bridge
//
// Every fetcher runs its backend work on a spawned task that pushes events
// into a bounded channel. The caller pulls those events back out as a lazy
// stream, waiting at most `receive_timeout` for each one. The task never
// returns anything directly: its result is turned into the single terminal
// `finish` report here, so no adapter can forget (or duplicate) it.

use futures::Stream;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::errors::FetchError;
use super::models::{FetcherEvent, Level, MediaMetadata, ProgressReport};

/// Lazy, single-consumer sequence of events for one attempt
pub type EventStream = Pin<Box<dyn Stream<Item = FetcherEvent> + Send + 'static>>;

/// How long the consumer waits for the next event before declaring a stall
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(300);

// Progress logs never come close to this; it only bounds a runaway producer.
const CHANNEL_CAPACITY: usize = 1024;

/// Push side of the bridge, handed to the worker
#[derive(Debug, Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<FetcherEvent>,
}

impl EventEmitter {
    pub async fn log(&self, level: Level, message: impl Into<String>) {
        self.send(FetcherEvent::Progress(ProgressReport::log(level, message)))
            .await;
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.log(Level::Debug, message).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(Level::Info, message).await;
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.log(Level::Warning, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(Level::Error, message).await;
    }

    /// Early metadata. Only the first one per attempt reaches the consumer.
    pub async fn metadata(&self, metadata: MediaMetadata) {
        self.send(FetcherEvent::MetadataAvailable { metadata }).await;
    }

    async fn send(&self, event: FetcherEvent) {
        if self.tx.send(event).await.is_err() {
            debug!("event consumer gone, dropping event");
        }
    }
}

/// Run `work` on a background task and expose its events as a stream.
///
/// `work` resolves to the final destination path on success. The stream's last
/// item is always a `finish` report: the worker's own outcome, or a synthetic
/// failure if the worker stalls past `receive_timeout` or dies silently.
/// Dropping the stream cancels the worker.
pub fn spawn_worker<F, Fut>(fetcher: &str, receive_timeout: Duration, work: F) -> EventStream
where
    F: FnOnce(EventEmitter) -> Fut + Send + 'static,
    Fut: Future<Output = Result<PathBuf, FetchError>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
    let emitter = EventEmitter { tx: tx.clone() };
    tokio::spawn(run_worker(fetcher.to_string(), tx, work(emitter)));

    let fetcher = fetcher.to_string();
    Box::pin(async_stream::stream! {
        let mut seq = 0u64;
        let mut metadata_seen = false;

        loop {
            let mut event = match tokio::time::timeout(receive_timeout, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    warn!(fetcher = %fetcher, "worker ended without reporting an outcome");
                    let mut report = ProgressReport::finish(
                        Level::Error,
                        1,
                        "fetcher ended without reporting an outcome",
                    );
                    report.seq = seq;
                    yield FetcherEvent::Progress(report);
                    break;
                }
                Err(_) => {
                    warn!(fetcher = %fetcher, timeout = ?receive_timeout, "worker stalled, abandoning it");
                    let mut report = ProgressReport::finish(
                        Level::Error,
                        1,
                        format!(
                            "fetcher stalled: no progress for {}s",
                            receive_timeout.as_secs_f32()
                        ),
                    );
                    report.seq = seq;
                    yield FetcherEvent::Progress(report);
                    break;
                }
            };

            match &mut event {
                FetcherEvent::MetadataAvailable { .. } => {
                    if metadata_seen {
                        debug!(fetcher = %fetcher, "dropping repeated metadata");
                        continue;
                    }
                    metadata_seen = true;
                }
                FetcherEvent::Progress(report) => {
                    report.seq = seq;
                    seq += 1;
                }
            }

            let finished = event.as_finish().is_some();
            yield event;
            if finished {
                break;
            }
        }
    })
}

async fn run_worker<Fut>(fetcher: String, tx: mpsc::Sender<FetcherEvent>, work: Fut)
where
    Fut: Future<Output = Result<PathBuf, FetchError>>,
{
    let outcome = tokio::select! {
        outcome = work => outcome,
        _ = tx.closed() => {
            debug!(fetcher = %fetcher, "consumer dropped the stream, cancelling worker");
            return;
        }
    };

    let report = match outcome {
        Ok(path) => match tokio::fs::try_exists(&path).await {
            Ok(true) => {
                info!(fetcher = %fetcher, path = %path.display(), "fetch complete");
                ProgressReport::finish(Level::Info, 0, "Fetcher complete")
            }
            _ => ProgressReport::finish(
                Level::Error,
                1,
                format!("fetcher reported success but {} does not exist", path.display()),
            ),
        },
        Err(e) => {
            warn!(fetcher = %fetcher, error = %e, "fetch attempt failed");
            ProgressReport::finish(Level::Error, e.status(), e.to_string())
        }
    };

    // Dropping the last sender afterwards closes the channel.
    let _ = tx.send(FetcherEvent::Progress(report)).await;
}
