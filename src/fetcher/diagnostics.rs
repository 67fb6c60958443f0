// Failure diagnostics - identifies why an upstream refused to hand over media
//
// Backends report failures as free text. This classifies that text so the
// terminal event can carry a short, recognisable reason.

/// Reasons an upstream might refuse a download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnosis {
    /// HTTP 403 Forbidden - general access denied
    Http403Forbidden,

    /// Rate limiting (429 or similar)
    RateLimited,

    /// Bot detection or captcha
    BotDetection,

    /// Geographic restriction
    GeoBlocked,

    /// Age-restricted content requiring login
    AgeRestricted,

    /// Private media requiring authorization
    PrivateMedia,

    /// Media deleted or unavailable
    MediaUnavailable,

    /// DRM-protected content. Permanent, no backend will get past it.
    DrmProtected,

    /// The backend does not understand this URL
    UnsupportedUrl,

    /// Network timeout or unreachable host
    NetworkTimeout,

    Unknown,
}

impl Diagnosis {
    /// Check if this is a permanent restriction (no workaround)
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::DrmProtected | Self::MediaUnavailable)
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Http403Forbidden => "Access denied (HTTP 403)",
            Self::RateLimited => "Rate limited by upstream",
            Self::BotDetection => "Bot detection triggered",
            Self::GeoBlocked => "Geographic restriction",
            Self::AgeRestricted => "Age-restricted content",
            Self::PrivateMedia => "Private media",
            Self::MediaUnavailable => "Media unavailable",
            Self::DrmProtected => "DRM-protected content",
            Self::UnsupportedUrl => "Unsupported URL",
            Self::NetworkTimeout => "Network timeout",
            Self::Unknown => "Unknown failure",
        }
    }
}

/// Analyze error text and return the failure reason
pub fn diagnose(error: &str) -> Option<Diagnosis> {
    let lower = error.to_lowercase();

    // Check patterns in order of specificity

    if lower.contains("drm")
        || lower.contains("widevine")
        || lower.contains("playready")
        || lower.contains("fairplay")
        || lower.contains("encrypted media")
    {
        return Some(Diagnosis::DrmProtected);
    }

    if lower.contains("unsupported url") || lower.contains("no suitable extractor") {
        return Some(Diagnosis::UnsupportedUrl);
    }

    if lower.contains("age-restricted")
        || lower.contains("sign in to confirm your age")
        || lower.contains("age_verification")
    {
        return Some(Diagnosis::AgeRestricted);
    }

    if lower.contains("private video") || lower.contains("is private") {
        return Some(Diagnosis::PrivateMedia);
    }

    if lower.contains("video unavailable")
        || lower.contains("has been removed")
        || lower.contains("no longer available")
        || lower.contains("is unavailable")
        || lower.contains("not currently available")
    {
        return Some(Diagnosis::MediaUnavailable);
    }

    if lower.contains("not available in your country")
        || lower.contains("blocked in your country")
        || lower.contains("geo restricted")
        || lower.contains("geo-restricted")
        || lower.contains("only available in the uk")
    {
        return Some(Diagnosis::GeoBlocked);
    }

    if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
        return Some(Diagnosis::RateLimited);
    }

    if lower.contains("captcha") || lower.contains("confirm you're not a bot") || lower.contains("unusual traffic") {
        return Some(Diagnosis::BotDetection);
    }

    if lower.contains("403") || lower.contains("forbidden") {
        return Some(Diagnosis::Http403Forbidden);
    }

    if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection refused")
        || lower.contains("network is unreachable")
    {
        return Some(Diagnosis::NetworkTimeout);
    }

    if !error.trim().is_empty() {
        return Some(Diagnosis::Unknown);
    }

    None
}

/// Append a recognised reason to a failure message.
///
/// Permanent reasons are flagged so the reader knows later fallbacks are
/// expected to fail the same way.
pub fn annotate(message: &str) -> String {
    match diagnose(message) {
        Some(Diagnosis::Unknown) | None => message.to_string(),
        Some(reason) if reason.is_permanent() => {
            format!("{} ({}, permanent)", message, reason.description())
        }
        Some(reason) => format!("{} ({})", message, reason.description()),
    }
}
