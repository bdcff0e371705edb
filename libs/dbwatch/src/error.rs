use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("http {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid header name {0}")]
    HeaderName(#[from] reqwest::header::InvalidHeaderName),
    #[error("invalid header value {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("json {0}")]
    Json(#[from] serde_json::Error),
    #[error("config {0}")]
    Config(#[from] config::ConfigError),
    #[error("empty payload")]
    EmptyPayload,
    #[error("transport {0}")]
    Transport(String),
    #[error("query spans {samples} samples, the backend allows fewer than {max}")]
    BudgetExceeded { samples: u64, max: u64 },
}

impl Error {
    /// Status 400 is the only failure surfaced to the user; everything else is
    /// logged and dropped.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, Error::Status { status: 400, .. })
    }

    /// Human readable message for a 400 response body. The backend replies
    /// with `{"error": ..}` or `{"message": ..}`, older builds with plain text.
    pub fn user_message(&self) -> Option<String> {
        let Error::Status { status: 400, body } = self else {
            return None;
        };
        let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
        let field = parsed.as_ref().and_then(|value| {
            ["error", "message"]
                .iter()
                .find_map(|key| value.get(key).and_then(|v| v.as_str()))
                .map(str::to_string)
        });
        Some(field.unwrap_or_else(|| body.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(status: u16, body: &str) -> Error {
        Error::Status {
            status,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_user_message_only_for_bad_request() {
        assert_eq!(
            status(400, r#"{"error":"bad dim"}"#).user_message().as_deref(),
            Some("bad dim")
        );
        assert_eq!(
            status(400, r#"{"message":"bad step"}"#).user_message().as_deref(),
            Some("bad step")
        );
        assert_eq!(
            status(400, " plain text\n").user_message().as_deref(),
            Some("plain text")
        );
        assert!(status(500, "oops").user_message().is_none());
        assert!(!status(500, "oops").is_bad_request());
        assert!(Error::EmptyPayload.user_message().is_none());
    }
}
