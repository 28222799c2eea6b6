//! # Error classifier.
//!
//! [`classify`] is a pure, total function that maps a transport failure or an
//! HTTP status to a recovery decision. Every handler consults it **before**
//! looking at redirects or bodies; a classifier result always wins.
//!
//! ## Rules (first match wins)
//! ```text
//! cancellation                      ─► ABORT
//! connection reset / host not found ─► SWAP
//! timeout / connection refused      ─► fallback.next
//! status 429 / 430                  ─► SWAP
//! status 303                        ─► QUEUE
//! status >= 500                     ─► fallback.next, message "<fallback> (<status>)"
//! anything else                     ─► None
//! ```

use crate::error::TransportKind;
use crate::task::State;

/// What the classifier looks at.
///
/// All fields are optional so the classifier can be asked about a response,
/// a transport failure, or nothing at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Signal {
    /// Response status, when a response arrived.
    pub status: Option<u16>,
    /// Transport failure class, when no response arrived.
    pub transport: Option<TransportKind>,
    /// Task cancellation observed.
    pub canceled: bool,
}

impl Signal {
    pub fn status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn transport(kind: TransportKind) -> Self {
        Self {
            transport: Some(kind),
            canceled: kind == TransportKind::Canceled,
            ..Self::default()
        }
    }

    pub fn canceled() -> Self {
        Self {
            canceled: true,
            ..Self::default()
        }
    }
}

/// State and status text to fall back to when the failure is transient.
#[derive(Debug, Clone, Copy)]
pub struct Fallback<'a> {
    pub next: State,
    pub message: &'a str,
}

/// Recovery decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: State,
    pub message: Option<String>,
}

impl Transition {
    fn to(next: State, message: impl Into<String>) -> Self {
        Self {
            next,
            message: Some(message.into()),
        }
    }
}

/// Classifies a transport failure or status code. Never panics.
pub fn classify(signal: &Signal, fallback: &Fallback<'_>) -> Option<Transition> {
    if signal.canceled {
        return Some(Transition {
            next: State::Abort,
            message: None,
        });
    }

    if let Some(kind) = signal.transport {
        match kind {
            TransportKind::Reset | TransportKind::HostNotFound => {
                return Some(Transition::to(State::Swap, "Connection issues, swapping proxy"));
            }
            TransportKind::Timeout | TransportKind::Refused => {
                return Some(Transition::to(fallback.next, fallback.message));
            }
            TransportKind::Canceled => {
                return Some(Transition {
                    next: State::Abort,
                    message: None,
                })
            }
            TransportKind::Other => {}
        }
    }

    match signal.status? {
        429 | 430 => Some(Transition::to(State::Swap, "Proxy banned, swapping proxy")),
        303 => Some(Transition::to(State::Queue, "Polling queue")),
        status if status >= 500 => Some(Transition::to(
            fallback.next,
            format!("{} ({status})", fallback.message),
        )),
        _ => None,
    }
}
