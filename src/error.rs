//! Error types used by the cartvisor runtime, checkout tasks and collaborators.
//!
//! - [`RuntimeError`] errors raised by the [`Manager`](crate::Manager) itself.
//! - [`TaskError`] errors raised inside a state handler; mapped to a state at the dispatch boundary.
//! - [`FetchError`] transport failures reported by an [`HttpSession`](crate::HttpSession).
//! - [`ParseError`] failures reported by a product [`Parser`](crate::Parser).
//! - [`ConfigError`] configuration decode failures.
//!
//! Every type provides `as_label` (stable snake_case label for logs).

use std::time::Duration;
use thiserror::Error;

/// # Errors produced by the manager runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some tasks or monitors were still running.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Ids of the units that did not exit in time.
        stuck: Vec<String>,
    },

    /// OS signal listeners could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signal(#[from] std::io::Error),
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use cartvisor::RuntimeError;
    /// use std::time::Duration;
    ///
    /// let err = RuntimeError::GraceExceeded { grace: Duration::from_secs(5), stuck: vec![] };
    /// assert_eq!(err.as_label(), "runtime_grace_exceeded");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
            RuntimeError::Signal(_) => "runtime_signal",
        }
    }
}

/// Low-level transport failure classes, as seen by the error classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Connection reset by peer.
    Reset,
    /// DNS resolution failed.
    HostNotFound,
    /// Connect or read timed out.
    Timeout,
    /// Connection refused.
    Refused,
    /// In-flight request aborted by the task's cancellation signal.
    Canceled,
    /// Anything else (TLS, protocol, body decoding...).
    Other,
}

impl TransportKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            TransportKind::Reset => "reset",
            TransportKind::HostNotFound => "host_not_found",
            TransportKind::Timeout => "timeout",
            TransportKind::Refused => "refused",
            TransportKind::Canceled => "canceled",
            TransportKind::Other => "other",
        }
    }
}

/// # Errors produced by an HTTP session.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// The request never produced a response.
    #[error("transport failure ({}): {message}", kind.as_label())]
    Transport {
        /// Failure class used by the classifier.
        kind: TransportKind,
        /// Underlying error text.
        message: String,
    },

    /// The request could not be built (bad URL, bad header...).
    #[error("invalid request: {reason}")]
    InvalidRequest {
        /// What was wrong with it.
        reason: String,
    },

    /// The proxy could not be installed on the session.
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy {
        /// Proxy URL as configured.
        proxy: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl FetchError {
    /// Builds a transport error of the given kind.
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        FetchError::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Transport class of this error; build failures count as [`TransportKind::Other`].
    pub fn kind(&self) -> TransportKind {
        match self {
            FetchError::Transport { kind, .. } => *kind,
            FetchError::InvalidRequest { .. } | FetchError::InvalidProxy { .. } => {
                TransportKind::Other
            }
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            FetchError::Transport { .. } => "fetch_transport",
            FetchError::InvalidRequest { .. } => "fetch_invalid_request",
            FetchError::InvalidProxy { .. } => "fetch_invalid_proxy",
        }
    }
}

/// # Errors produced inside a checkout state handler.
///
/// Handlers return `Result<State, TaskError>`. The dispatch loop turns
/// [`TaskError::Canceled`] into `ABORT` and everything else into `ERROR`.
/// Transport failures and status codes are normally absorbed by the
/// classifier before they become a `TaskError`.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// Session-level transport failure that could not be classified.
    #[error("transport failure: {0}")]
    Transport(#[from] FetchError),

    /// Unexpected HTTP status for a step that requires success.
    #[error("unexpected status {status}")]
    HttpStatus {
        /// Response status code.
        status: u16,
    },

    /// Expected token or pattern absent from a response.
    #[error("missing {what}")]
    Parse {
        /// What was expected.
        what: &'static str,
    },

    /// Explicit site condition (out of stock, invalid store, unsupported country...).
    #[error("{reason}")]
    Business {
        /// Status text shown to the user.
        reason: String,
    },

    /// The task was cancelled.
    #[error("task cancelled")]
    Canceled,
}

impl TaskError {
    /// Builds a business error from a status message.
    pub fn business(reason: impl Into<String>) -> Self {
        TaskError::Business {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label (snake_case) for use in logs.
    ///
    /// # Example
    /// ```
    /// use cartvisor::TaskError;
    ///
    /// let err = TaskError::business("Invalid store");
    /// assert_eq!(err.as_label(), "task_business");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Transport(_) => "task_transport",
            TaskError::HttpStatus { .. } => "task_http_status",
            TaskError::Parse { .. } => "task_parse",
            TaskError::Business { .. } => "task_business",
            TaskError::Canceled => "task_canceled",
        }
    }

    /// Status text shown to the user when this error ends a task.
    pub fn as_message(&self) -> String {
        match self {
            TaskError::Business { reason } => reason.clone(),
            TaskError::HttpStatus { status } => format!("Unexpected response ({status})"),
            TaskError::Parse { what } => format!("Missing {what}"),
            TaskError::Transport(e) => format!("Connection issues ({})", e.kind().as_label()),
            TaskError::Canceled => "Stopped".to_string(),
        }
    }
}

/// # Errors produced by a product parser.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParseError {
    /// The request failed before a response was received.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The store answered with a status the parser cannot use.
    #[error("unexpected status {status}")]
    Status {
        /// Response status code.
        status: u16,
    },

    /// No product matched the configured matcher.
    #[error("no product matched")]
    NotFound,

    /// A product matched but it is a placeholder without purchasable variants.
    #[error("placeholder product")]
    Placeholder,

    /// The storefront is behind a password page.
    #[error("store is password protected")]
    Password,

    /// The parser does not handle this matcher kind.
    #[error("{parser} does not support this matcher")]
    Unsupported {
        /// Parser name.
        parser: &'static str,
    },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ParseError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ParseError::Fetch(_) => "parse_fetch",
            ParseError::Status { .. } => "parse_status",
            ParseError::NotFound => "parse_not_found",
            ParseError::Placeholder => "parse_placeholder",
            ParseError::Password => "parse_password",
            ParseError::Unsupported { .. } => "parse_unsupported",
            ParseError::Malformed(_) => "parse_malformed",
        }
    }
}

/// # Errors produced while decoding configuration.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid TOML document.
    #[error("invalid toml: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid JSON document.
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Toml(_) => "config_toml",
            ConfigError::Json(_) => "config_json",
        }
    }
}
