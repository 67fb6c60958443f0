// Event vocabulary shared by every fetcher and every consumer

use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Shape of the media the caller wants back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Format {
    VideoAndAudio,
    /// Video stream only (muted)
    VideoOnly,
    AudioOnly,
}

impl Format {
    /// Human-readable label
    pub fn label(&self) -> &'static str {
        match self {
            Self::VideoAndAudio => "Video+Audio",
            Self::VideoOnly => "Video Only (muted)",
            Self::AudioOnly => "Audio Only",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Source-agnostic description of a piece of media.
///
/// Every field except `url` falls back to an "unknown" value so a consumer can
/// always render a card, however little the backend told us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub url: String,
    pub name: String,
    pub author: String,
    pub author_url: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub uploaded_at: Option<OffsetDateTime>,
    pub duration: String,
    pub format: String,
    pub thumbnail_url: Option<String>,
}

impl MediaMetadata {
    pub const UNKNOWN_NAME: &'static str = "Unknown Name";
    pub const UNKNOWN_AUTHOR: &'static str = "Unknown Author";
    pub const UNKNOWN_DURATION: &'static str = "Unknown Duration";
    pub const UNKNOWN_FORMAT: &'static str = "Unknown Format";

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: Self::UNKNOWN_NAME.to_string(),
            author: Self::UNKNOWN_AUTHOR.to_string(),
            author_url: None,
            uploaded_at: None,
            duration: Self::UNKNOWN_DURATION.to_string(),
            format: Self::UNKNOWN_FORMAT.to_string(),
            thumbnail_url: None,
        }
    }
}

/// Whether a report is advisory or closes the attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Log,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A log line or the terminal outcome of an attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressReport {
    pub kind: ReportKind,
    pub level: Level,
    pub message: String,
    /// 0 on success; any other value is a failure. Always 0 for `Log`.
    pub status: i32,
    /// Position within the attempt, starting at 0
    pub seq: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl ProgressReport {
    /// Advisory log line. `seq` is assigned when the consumer receives it.
    pub fn log(level: Level, message: impl Into<String>) -> Self {
        Self {
            kind: ReportKind::Log,
            level,
            message: message.into(),
            status: 0,
            seq: 0,
            at: OffsetDateTime::now_utc(),
        }
    }

    pub fn finish(level: Level, status: i32, message: impl Into<String>) -> Self {
        Self {
            kind: ReportKind::Finish,
            level,
            message: message.into(),
            status,
            seq: 0,
            at: OffsetDateTime::now_utc(),
        }
    }

    pub fn is_finish(&self) -> bool {
        self.kind == ReportKind::Finish
    }

    pub fn is_success(&self) -> bool {
        self.is_finish() && self.status == 0
    }
}

// Timestamps are deliberately ignored: two runs of the same attempt compare equal.
impl PartialEq for ProgressReport {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.level == other.level
            && self.message == other.message
            && self.status == other.status
            && self.seq == other.seq
    }
}

/// Anything a fetcher reports over the course of one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FetcherEvent {
    MetadataAvailable { metadata: MediaMetadata },
    Progress(ProgressReport),
}

impl FetcherEvent {
    /// The terminal report, if this is one
    pub fn as_finish(&self) -> Option<&ProgressReport> {
        match self {
            Self::Progress(report) if report.is_finish() => Some(report),
            _ => None,
        }
    }
}

impl fmt::Display for FetcherEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MetadataAvailable { metadata } => write!(
                f,
                "{} by {} ({}, {})",
                metadata.name, metadata.author, metadata.duration, metadata.format
            ),
            Self::Progress(report) if report.is_finish() => {
                write!(f, "[{}] finish status={}: {}", report.level, report.status, report.message)
            }
            Self::Progress(report) => write!(f, "[{}] {}", report.level, report.message),
        }
    }
}

/// Render a number of seconds as e.g. "1 hour 2 minutes 5 seconds"
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    let plural = |n: u64| if n == 1 { "" } else { "s" };

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{} hour{}", hours, plural(hours)));
    }
    if minutes > 0 {
        parts.push(format!("{} minute{}", minutes, plural(minutes)));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{} second{}", seconds, plural(seconds)));
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_defaults_to_unknown() {
        let meta = MediaMetadata::new("https://example.com/a");
        assert_eq!(meta.name, MediaMetadata::UNKNOWN_NAME);
        assert_eq!(meta.author, MediaMetadata::UNKNOWN_AUTHOR);
        assert_eq!(meta.duration, MediaMetadata::UNKNOWN_DURATION);
        assert!(meta.author_url.is_none());
        assert!(meta.uploaded_at.is_none());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0 seconds");
        assert_eq!(format_duration(1), "1 second");
        assert_eq!(format_duration(61), "1 minute 1 second");
        assert_eq!(format_duration(3600), "1 hour");
        assert_eq!(format_duration(7325), "2 hours 2 minutes 5 seconds");
    }

    #[test]
    fn test_report_equality_ignores_timestamp() {
        let a = ProgressReport {
            kind: ReportKind::Finish,
            level: Level::Info,
            message: "Fetcher complete".to_string(),
            status: 0,
            seq: 3,
            at: OffsetDateTime::UNIX_EPOCH,
        };
        let b = ProgressReport { at: OffsetDateTime::now_utc(), ..a.clone() };
        assert_eq!(a, b);
        assert!(a.is_success());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = FetcherEvent::MetadataAvailable {
            metadata: MediaMetadata::new("https://example.com/a"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "metadata_available");
        assert_eq!(json["metadata"]["url"], "https://example.com/a");
    }
}
