use crate::error_kind::ErrorKind;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "rate_limiter.capacity")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "rate_limiter", "health_monitor")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the resilience core.
///
/// Expected degraded conditions (throttled, unhealthy) are reported through
/// return values by the limiter and the monitor; these variants exist so that
/// callers and the retry policy can carry them across an `?` boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Rate limit exceeded: {message}")]
    RateLimitExceeded {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Service unhealthy: {message}")]
    ServiceUnhealthy { message: String },

    #[error("Transient network error: {message}")]
    TransientNetwork { message: String },

    #[error("Authentication failure: {message}")]
    Auth { message: String },

    #[error("Session could not be recovered; re-authentication required: {message}")]
    ReauthenticationRequired { message: String },

    #[error("Requested cost {cost} exceeds limiter capacity {capacity}")]
    CostExceedsCapacity { cost: u32, capacity: f64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Upstream error{}: {message}", format_status(.status))]
    Upstream { status: Option<u16>, message: String },

    #[error("Monitoring snapshot too large: {size} bytes (limit {limit})")]
    SnapshotTooLarge { size: usize, limit: usize },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {})", s),
        None => String::new(),
    }
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Wrap an unstructured error arriving from the backend.
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::TransientNetwork {
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Error::Auth {
            message: message.into(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Error::ServiceUnhealthy {
            message: message.into(),
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Structured kind used by the retry classifier.
    ///
    /// `Upstream` errors are resolved from their HTTP status first and fall back
    /// to keyword matching over the message text.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RateLimitExceeded { .. } => ErrorKind::RateLimited,
            Error::ServiceUnhealthy { .. } => ErrorKind::ServiceUnhealthy,
            Error::TransientNetwork { .. } => ErrorKind::TransientNetwork,
            Error::Auth { .. } | Error::ReauthenticationRequired { .. } => ErrorKind::Auth,
            Error::CostExceedsCapacity { .. } => ErrorKind::Programming,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Upstream { status, message } => {
                // A status that only says "unknown" should not hide an auth keyword in the text.
                let from_message = ErrorKind::from_message(message);
                match status.map(ErrorKind::from_http_status) {
                    Some(kind) if kind != ErrorKind::Other => {
                        if from_message == ErrorKind::Auth {
                            ErrorKind::Auth
                        } else {
                            kind
                        }
                    }
                    _ => from_message,
                }
            }
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => ErrorKind::TransientNetwork,
                std::io::ErrorKind::PermissionDenied => ErrorKind::Auth,
                _ => ErrorKind::Other,
            },
            Error::SnapshotTooLarge { .. }
            | Error::Configuration { .. }
            | Error::Serialization(_)
            | Error::Yaml(_) => ErrorKind::Programming,
        }
    }

    /// Whether this terminal failure should send the user back to sign-in.
    pub fn requires_reauthentication(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    /// Message suitable for surfacing in the dashboard instead of a generic crash.
    pub fn user_message(&self) -> &'static str {
        match self.kind() {
            ErrorKind::RateLimited | ErrorKind::ServiceUnhealthy => {
                "Service temporarily limited. Please try again in a moment."
            }
            ErrorKind::Auth => "Your session has expired. Please sign in again.",
            ErrorKind::TransientNetwork => {
                "Network connection problem. Please check your connection and retry."
            }
            ErrorKind::Cancelled => "The operation was cancelled.",
            ErrorKind::Programming | ErrorKind::Other => "Something went wrong.",
        }
    }
}
