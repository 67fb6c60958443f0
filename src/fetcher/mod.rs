// Fetcher module - pluggable media backends with prioritised fallback

pub mod backends;
pub mod bridge;
pub mod diagnostics;
pub mod errors;
pub mod finalize;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod traits;

pub use bridge::{spawn_worker, EventEmitter, EventStream};
pub use errors::FetchError;
pub use models::{FetcherEvent, Format, Level, MediaMetadata, ProgressReport, ReportKind};
pub use orchestrator::{FailureReason, Orchestrator, SlurpEvent, SlurpStream};
pub use registry::FetcherRegistry;
pub use traits::Fetcher;
