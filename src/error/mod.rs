use thiserror::Error;

pub type Result<T> = std::result::Result<T, MetricsError>;

const MAX_BODY_CHARS: usize = 512;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("upstream returned HTTP {status} for {url}: {body}")]
    Upstream {
        status: u16,
        url: String,
        body: String,
    },
    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse { url: String, reason: String },
    #[error("clone of {repo} failed: {reason}")]
    Clone { repo: String, reason: String },
    #[error("clone of {repo} timed out after {secs}s")]
    CloneTimeout { repo: String, secs: u64 },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetricsError {
    pub fn upstream(status: u16, url: impl Into<String>, body: &str) -> Self {
        Self::Upstream {
            status,
            url: url.into(),
            body: truncate(body, MAX_BODY_CHARS),
        }
    }

    pub fn malformed(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(format!("{err:#}"))
    }

    /// Errors that only cost one repository (or one repository within one
    /// window); everything else ends the refresh.
    pub fn is_scoped(&self) -> bool {
        matches!(
            self,
            Self::Upstream { .. }
                | Self::Transport { .. }
                | Self::Clone { .. }
                | Self::CloneTimeout { .. }
                | Self::Io(_)
                | Self::Json(_)
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_body_is_truncated() {
        let body = "x".repeat(2000);
        let err = MetricsError::upstream(500, "https://api.example.test/x", &body);
        match err {
            MetricsError::Upstream { body, status, .. } => {
                assert_eq!(status, 500);
                assert_eq!(body.len(), MAX_BODY_CHARS + 3);
                assert!(body.ends_with("..."));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn scope_classification() {
        assert!(MetricsError::upstream(404, "u", "").is_scoped());
        assert!(MetricsError::CloneTimeout {
            repo: "a/b".into(),
            secs: 1
        }
        .is_scoped());
        assert!(!MetricsError::Configuration("missing".into()).is_scoped());
        assert!(!MetricsError::malformed("u", "short page").is_scoped());
        assert!(!MetricsError::Persistence("disk".into()).is_scoped());
    }
}
