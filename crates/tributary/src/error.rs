//! Error taxonomy shared by every harvesting stage.
//!
//! Errors fall into a few families that drive retry and abort decisions:
//!
//! - transport and HTTP status failures are retried by the async client
//! - authentication failures surface immediately
//! - parse failures abort the current item
//! - cancellation is kept distinct from genuine failures
//! - persistence failures are fatal to the current run

use sea_orm::DbErr;
use thiserror::Error;

/// Errors that can occur while harvesting, extracting or converting data.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// DNS, connect, timeout or other transport-level failure.
    #[error("transport error calling {url}: {message}")]
    Transport { url: String, message: String },

    /// The remote API answered with an error status.
    #[error("http {status} calling {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },

    /// A request kept failing after every allowed retry.
    #[error("retry exceeded {retries} times calling {url}")]
    RetryExceeded {
        retries: usize,
        url: String,
        #[source]
        source: Box<HarvestError>,
    },

    /// Authentication or authorization was rejected by the remote API.
    #[error("unauthorized ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    /// A payload could not be parsed.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// The remote API returned an empty body where content was expected.
    #[error("empty response from {url}")]
    EmptyResponse { url: String },

    /// A GraphQL query returned data errors.
    #[error("graphql error: {message}")]
    Graphql { message: String },

    /// A URL template could not be parsed or rendered.
    #[error("url template error: {message}")]
    Template { message: String },

    /// The operation was cancelled through the shutdown signal.
    #[error("operation cancelled")]
    Cancelled,

    /// A scheduled task panicked.
    #[error("task panicked: {message}")]
    Panicked { message: String },

    /// Database error while reading or writing a store.
    #[error("database error: {0}")]
    Persistence(#[from] DbErr),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// A builder was finished without a required field.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Several concurrent tasks failed.
    #[error("{} tasks failed, first error: {}", .0.len(), first_message(.0))]
    Combined(Vec<HarvestError>),

    /// Unexpected/internal error.
    #[error("internal error: {message}")]
    Internal { message: String },
}

fn first_message(errors: &[HarvestError]) -> String {
    errors
        .first()
        .map(|e| short_error_message(e))
        .unwrap_or_default()
}

impl HarvestError {
    /// Create a transport error.
    #[inline]
    pub fn transport(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a parse error.
    #[inline]
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }

    /// Create a template error.
    #[inline]
    pub fn template(message: impl Into<String>) -> Self {
        Self::Template {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[inline]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is the cancellation signal.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if retrying the same request could succeed.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::HttpStatus { .. })
    }

    /// Check if this error is an authentication failure.
    #[inline]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Fold a list of task errors into a single result.
    ///
    /// Cancellations are only reported when nothing else failed, so a genuine
    /// failure is never hidden behind the shutdown that followed it.
    pub fn combine(errors: Vec<HarvestError>) -> Result<()> {
        let total = errors.len();
        let mut failures: Vec<HarvestError> =
            errors.into_iter().filter(|e| !e.is_cancelled()).collect();

        match failures.len() {
            0 if total == 0 => Ok(()),
            0 => Err(Self::Cancelled),
            1 => Err(failures.remove(0)),
            _ => Err(Self::Combined(failures)),
        }
    }
}

/// Extract a short error message suitable for display.
///
/// Takes the first line of an error message, which keeps multi-line response
/// bodies out of log lines and progress events.
#[inline]
pub fn short_error_message(e: &impl std::error::Error) -> String {
    let full = e.to_string();
    full.lines().next().unwrap_or(&full).to_string()
}

/// Result type for harvesting operations.
pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_returns_ok_for_no_errors() {
        assert!(HarvestError::combine(Vec::new()).is_ok());
    }

    #[test]
    fn combine_reports_cancelled_only_when_nothing_else_failed() {
        let err = HarvestError::combine(vec![HarvestError::Cancelled, HarvestError::Cancelled])
            .expect_err("expected cancellation");
        assert!(err.is_cancelled());

        let err = HarvestError::combine(vec![
            HarvestError::Cancelled,
            HarvestError::parse("bad payload"),
        ])
        .expect_err("expected failure");
        assert!(matches!(err, HarvestError::Parse { .. }));
    }

    #[test]
    fn combine_wraps_multiple_failures() {
        let err = HarvestError::combine(vec![
            HarvestError::parse("first"),
            HarvestError::internal("second"),
        ])
        .expect_err("expected combined error");

        match &err {
            HarvestError::Combined(inner) => assert_eq!(inner.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "2 tasks failed, first error: parse error: first"
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(HarvestError::transport("http://x", "reset").is_retryable());
        assert!(
            HarvestError::HttpStatus {
                status: 502,
                url: "http://x".into(),
                body: String::new(),
            }
            .is_retryable()
        );
        assert!(
            !HarvestError::Unauthorized {
                status: 401,
                message: "nope".into(),
            }
            .is_retryable()
        );
        assert!(!HarvestError::Cancelled.is_retryable());
        assert!(!HarvestError::parse("x").is_retryable());
    }

    #[test]
    fn short_error_message_keeps_first_line() {
        let err = HarvestError::HttpStatus {
            status: 500,
            url: "http://x".into(),
            body: "line one\nline two".into(),
        };
        assert_eq!(short_error_message(&err), "http 500 calling http://x: line one");
    }
}
