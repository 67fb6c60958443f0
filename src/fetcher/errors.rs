// Error types for fetcher backends

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// Backend binary missing or not callable
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Could not start or wait on a backend process
    #[error("execution error: {0}")]
    Execution(String),

    #[error("{program} exited with code {code}{}", detail_suffix(.detail))]
    ProcessFailed {
        program: String,
        code: i32,
        detail: String,
    },

    /// Upstream answered with an HTTP error
    #[error("backend returned status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no metadata: {0}")]
    NoMetadata(String),

    #[error("ambiguous query: {0}")]
    AmbiguousQuery(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no bytes received")]
    EmptyTransfer,

    /// Bytes were fetched but could not be placed at the destination
    #[error("transfer succeeded, placement failed: moving {} to {}: {source}", .from.display(), .to.display())]
    Finalize {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("timed out: {0}")]
    Timeout(String),

    /// Configuration makes the fetcher unusable
    #[error("fetcher misconfigured: {0}")]
    Misconfigured(String),
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(": {}", detail)
    }
}

impl FetchError {
    /// Nonzero status placed in the terminal event for this failure
    pub fn status(&self) -> i32 {
        match self {
            Self::Http { status, .. } => i32::from(*status),
            Self::ProcessFailed { code, .. } if *code != 0 => *code,
            _ => 1,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(e.to_string());
        }
        match e.status() {
            Some(status) => Self::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => Self::Request(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

// Classify raw backend output
impl From<String> for FetchError {
    fn from(s: String) -> Self {
        let lower = s.to_lowercase();

        if lower.contains("timeout") || lower.contains("timed out") {
            return Self::Timeout(s);
        }

        if lower.contains("not found")
            || lower.contains("no such file")
            || lower.contains("command not found")
        {
            return Self::ToolNotFound(s);
        }

        if lower.contains("parse") || lower.contains("json") {
            return Self::Parse(s);
        }

        Self::Execution(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_is_reported() {
        let err = FetchError::Http {
            status: 429,
            message: "rate limited".to_string(),
        };
        assert_eq!(err.status(), 429);
    }

    #[test]
    fn test_process_exit_code_is_reported() {
        let err = FetchError::ProcessFailed {
            program: "yt-dlp".to_string(),
            code: 2,
            detail: String::new(),
        };
        assert_eq!(err.status(), 2);
        assert_eq!(err.to_string(), "yt-dlp exited with code 2");
    }

    #[test]
    fn test_generic_failures_use_status_one() {
        assert_eq!(FetchError::EmptyTransfer.status(), 1);
        assert_eq!(FetchError::Parse("x".to_string()).status(), 1);
    }

    #[test]
    fn test_finalize_message_names_placement() {
        let err = FetchError::Finalize {
            from: PathBuf::from("/out/temp/a.tmp"),
            to: PathBuf::from("/out/a.mp4"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(err.to_string().starts_with("transfer succeeded, placement failed"));
    }

    #[test]
    fn test_string_classification() {
        assert!(matches!(
            FetchError::from("Timed out after 3s".to_string()),
            FetchError::Timeout(_)
        ));
        assert!(matches!(
            FetchError::from("get_iplayer: command not found".to_string()),
            FetchError::ToolNotFound(_)
        ));
        assert!(matches!(
            FetchError::from("Invalid JSON at line 1".to_string()),
            FetchError::Parse(_)
        ));
        assert!(matches!(
            FetchError::from("something else".to_string()),
            FetchError::Execution(_)
        ));
    }
}
