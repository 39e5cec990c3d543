// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]
//! Unified error taxonomy for the birdex asset materialization engine.
//!
//! Every component in the engine raises [`BdxError`], a closed sum of the
//! error kinds named by the design: transport failures, rate limiting,
//! upstream request/response errors, validation, advisory-lock conflicts,
//! and schema-invariant violations. Each variant carries the structured
//! fields a caller needs to decide how to react (retry, defer, surface to
//! an operator) without downcasting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family an error belongs to, used for metrics bucketing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network / socket failures talking to the upstream provider.
    Transport,
    /// The upstream provider asked us to slow down.
    RateLimit,
    /// The upstream provider rejected a well-formed request (4xx).
    UpstreamRequest,
    /// The upstream provider returned something we can't parse or a 5xx.
    UpstreamUnexpectedResponse,
    /// A config/input invariant was violated.
    Validation,
    /// An advisory lock was held, or two planners raced.
    Conflict,
    /// A schema invariant was violated; should not occur in practice.
    Fatal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Transport => "transport",
            Self::RateLimit => "rate_limit",
            Self::UpstreamRequest => "upstream_request",
            Self::UpstreamUnexpectedResponse => "upstream_unexpected_response",
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// BdxError
// ---------------------------------------------------------------------------

/// The unified error sum raised by every `bdx-*` crate.
///
/// # Examples
///
/// ```
/// use bdx_error::{BdxError, ErrorCategory};
///
/// let err = BdxError::rate_limit(Some(30));
/// assert_eq!(err.category(), ErrorCategory::RateLimit);
/// ```
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BdxError {
    /// Network / socket failure reaching the upstream provider. Retryable
    /// at the tick level; never aborts a tick.
    #[error("transport error: {message}")]
    Transport {
        /// Human-readable description of the transport failure.
        message: String,
    },

    /// The upstream provider responded `429`. Internal ingest callers defer.
    #[error("rate limited{}", retry_after_seconds.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimit {
        /// Seconds to wait before retrying, if the provider supplied one.
        retry_after_seconds: Option<u64>,
    },

    /// The upstream provider rejected a well-formed request (4xx, not 429).
    #[error("upstream request error: status {status}")]
    UpstreamRequest {
        /// HTTP status code returned.
        status: u16,
        /// Response body, capped by the caller before storage.
        body: String,
    },

    /// The upstream provider returned a 5xx, or a response we couldn't
    /// parse as JSON.
    #[error("unexpected upstream response: {detail}")]
    UpstreamUnexpectedResponse {
        /// Description of what was unexpected (status, parse error, ...).
        detail: String,
    },

    /// A config/input invariant was violated. The planner records a
    /// planner event and skips the affected instance.
    #[error("validation error: {message}")]
    Validation {
        /// Human-readable description of the violated invariant.
        message: String,
    },

    /// An advisory lock is held by another worker, or two planners raced
    /// for the same instance. The caller defers and retries next tick.
    #[error("conflict: {message}")]
    Conflict {
        /// Human-readable description of the conflict.
        message: String,
    },

    /// A schema invariant was violated (e.g. a materialization's
    /// dependency set didn't match the registry). Should not occur;
    /// surfaces out of the tick when it does.
    #[error("fatal: {message}")]
    Fatal {
        /// Human-readable description of the violated invariant.
        message: String,
    },
}

impl BdxError {
    /// Shorthand constructor for [`BdxError::Transport`].
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`BdxError::RateLimit`].
    #[must_use]
    pub fn rate_limit(retry_after_seconds: Option<u64>) -> Self {
        Self::RateLimit {
            retry_after_seconds,
        }
    }

    /// Shorthand constructor for [`BdxError::UpstreamRequest`].
    #[must_use]
    pub fn upstream_request(status: u16, body: impl Into<String>) -> Self {
        Self::UpstreamRequest {
            status,
            body: body.into(),
        }
    }

    /// Shorthand constructor for [`BdxError::UpstreamUnexpectedResponse`].
    #[must_use]
    pub fn upstream_unexpected(detail: impl Into<String>) -> Self {
        Self::UpstreamUnexpectedResponse {
            detail: detail.into(),
        }
    }

    /// Shorthand constructor for [`BdxError::Validation`].
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`BdxError::Conflict`].
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Shorthand constructor for [`BdxError::Fatal`].
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// The broad category this error belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport { .. } => ErrorCategory::Transport,
            Self::RateLimit { .. } => ErrorCategory::RateLimit,
            Self::UpstreamRequest { .. } => ErrorCategory::UpstreamRequest,
            Self::UpstreamUnexpectedResponse { .. } => ErrorCategory::UpstreamUnexpectedResponse,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Conflict { .. } => ErrorCategory::Conflict,
            Self::Fatal { .. } => ErrorCategory::Fatal,
        }
    }

    /// `true` for errors that a tick should treat as "try again later"
    /// rather than a hard failure: transport hiccups, rate limits, and
    /// advisory-lock conflicts.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::RateLimit { .. } | Self::Conflict { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// PlannerEvent decision / error payload helpers
// ---------------------------------------------------------------------------

/// Serializable snapshot of a [`BdxError`] suitable for storing in an
/// `error_payload` column alongside a materialization or ingest run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    /// Broad category, duplicated out of the error for cheap filtering.
    pub category: ErrorCategory,
    /// Full error, serialized via `BdxError`'s own `Serialize` impl.
    pub error: BdxError,
    /// Arbitrary extra context (instance id, slug, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl ErrorPayload {
    /// Wrap an error with no extra context.
    #[must_use]
    pub fn new(error: BdxError) -> Self {
        Self {
            category: error.category(),
            error,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair of diagnostic context.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_mapping_is_total() {
        let cases = [
            (BdxError::transport("x"), ErrorCategory::Transport),
            (BdxError::rate_limit(None), ErrorCategory::RateLimit),
            (
                BdxError::upstream_request(404, "nope"),
                ErrorCategory::UpstreamRequest,
            ),
            (
                BdxError::upstream_unexpected("bad json"),
                ErrorCategory::UpstreamUnexpectedResponse,
            ),
            (BdxError::validation("missing"), ErrorCategory::Validation),
            (BdxError::conflict("locked"), ErrorCategory::Conflict),
            (BdxError::fatal("invariant"), ErrorCategory::Fatal),
        ];
        for (err, expected) in cases {
            assert_eq!(err.category(), expected);
        }
    }

    #[test]
    fn retryable_kinds() {
        assert!(BdxError::transport("x").is_retryable());
        assert!(BdxError::rate_limit(Some(5)).is_retryable());
        assert!(BdxError::conflict("locked").is_retryable());
        assert!(!BdxError::fatal("invariant").is_retryable());
        assert!(!BdxError::validation("bad").is_retryable());
    }

    #[test]
    fn display_includes_retry_after() {
        let err = BdxError::rate_limit(Some(30));
        assert_eq!(err.to_string(), "rate limited, retry after 30s");
        let err = BdxError::rate_limit(None);
        assert_eq!(err.to_string(), "rate limited");
    }

    #[test]
    fn error_payload_roundtrips_through_json() {
        let payload =
            ErrorPayload::new(BdxError::conflict("instance locked")).with_context("instance_id", "42");
        let json = serde_json::to_string(&payload).unwrap();
        let back: ErrorPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
