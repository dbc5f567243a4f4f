//! 错误分类：将结构化错误与上游文本错误映射为统一的错误种类。
//!
//! Error kinds used by the retry classifier.
//!
//! Every [`crate::Error`] resolves to exactly one [`ErrorKind`]. Errors that
//! arrive from the backend as unstructured text are resolved through
//! [`ErrorKind::from_http_status`] and, as a last resort,
//! [`ErrorKind::from_message`].
//!
//! | Kind               | Retryable | Handling                                 |
//! |--------------------|-----------|------------------------------------------|
//! | `RateLimited`      | yes       | queue or wait                            |
//! | `TransientNetwork` | yes       | retry with backoff                       |
//! | `ServiceUnhealthy` | no        | circuit open, skip or degrade            |
//! | `Auth`             | never     | one-shot session recovery                |
//! | `Programming`      | no        | fatal, fix the caller                    |
//! | `Cancelled`        | no        | caller abandoned the call                |
//! | `Other`            | no        | surfaced to the error boundary           |
//!
//! ## Example
//!
//! ```rust
//! use dashboard_resilience::error_kind::ErrorKind;
//!
//! assert_eq!(ErrorKind::from_message("JWT expired"), ErrorKind::Auth);
//! assert_eq!(ErrorKind::from_message("read ECONNRESET"), ErrorKind::TransientNetwork);
//! assert!(!ErrorKind::Auth.retryable());
//! ```

use serde::Serialize;
use std::fmt;

/// Keywords that mark an error as authentication or authorization related.
///
/// Checked before the transient set: an error mentioning both is treated as auth.
const AUTH_KEYWORDS: &[&str] = &[
    "jwt",
    "unauthorized",
    "unauthorised",
    "forbidden",
    "permission",
    "not authorized",
    "access denied",
    "invalid token",
    "token expired",
    "expired token",
    "invalid_grant",
    "refresh token",
    "refresh_token",
    "access token",
    "credential",
    "invalid api key",
    "row-level security",
    "row level security",
    "tenant",
    "not a member",
];

/// Keywords that mark an error as transient and worth retrying.
const TRANSIENT_KEYWORDS: &[&str] = &[
    "timeout",
    "timed out",
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "econnaborted",
    "socket hang up",
    "network",
    "fetch failed",
    "failed to fetch",
    "dns",
    "enotfound",
    "eai_again",
    "getaddrinfo",
    "too many requests",
    "rate limit",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "temporarily unavailable",
];

/// Status codes recognized in message text. Only standalone numbers count,
/// so "4031 ms" is not a 403.
const AUTH_STATUS_CODES: &[&str] = &["401", "403"];
const RATE_LIMIT_STATUS_CODES: &[&str] = &["429"];
const TRANSIENT_STATUS_CODES: &[&str] = &["502", "503", "504"];

fn mentions_status(message: &str, codes: &[&str]) -> bool {
    codes.iter().any(|code| {
        message.match_indices(code).any(|(i, _)| {
            let before = message[..i].chars().next_back();
            let after = message[i + code.len()..].chars().next();
            let digit = |c: Option<char>| c.is_some_and(|c| c.is_ascii_digit());
            !digit(before) && !digit(after)
        })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream quota or local limiter said "not now".
    RateLimited,
    /// Connectivity or server-side transient failure.
    TransientNetwork,
    /// The health circuit is open.
    ServiceUnhealthy,
    /// Token, credential, permission or tenant-boundary failure.
    Auth,
    /// Misuse of the API by the caller (e.g. cost above capacity).
    Programming,
    /// The caller cancelled the operation.
    Cancelled,
    /// Anything not classified above.
    Other,
}

impl ErrorKind {
    /// Returns whether errors of this kind may be retried.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::TransientNetwork)
    }

    #[inline]
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth)
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::TransientNetwork => "transient_network",
            Self::ServiceUnhealthy => "service_unhealthy",
            Self::Auth => "auth",
            Self::Programming => "programming",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }

    /// Maps an HTTP status code to the most likely kind.
    ///
    /// Statuses without a mapping return `ErrorKind::Other` so the caller can
    /// fall back to message matching.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            429 => Self::RateLimited,
            408 | 502 | 503 | 504 | 522 | 524 => Self::TransientNetwork,
            _ => Self::Other,
        }
    }

    /// Keyword adapter for errors that only carry text.
    pub fn from_message(message: &str) -> Self {
        let m = message.to_lowercase();
        if AUTH_KEYWORDS.iter().any(|k| m.contains(k)) || mentions_status(&m, AUTH_STATUS_CODES) {
            return Self::Auth;
        }
        if m.contains("too many requests")
            || m.contains("rate limit")
            || mentions_status(&m, RATE_LIMIT_STATUS_CODES)
        {
            return Self::RateLimited;
        }
        if TRANSIENT_KEYWORDS.iter().any(|k| m.contains(k))
            || mentions_status(&m, TRANSIENT_STATUS_CODES)
        {
            return Self::TransientNetwork;
        }
        Self::Other
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
