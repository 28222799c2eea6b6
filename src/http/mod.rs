//! # HTTP plumbing shared by tasks and monitors.
//!
//! Tasks and monitors never touch `reqwest` directly. They talk to an
//! [`HttpSession`] produced by a [`Connector`], so the state machine can be
//! driven by a scripted session in tests.
//!
//! ```text
//! Connector::session(store, proxy) ──► Box<dyn HttpSession>
//!                                           │
//!      CheckoutTask / Monitor ── send(HttpRequest) ──► HttpResponse | FetchError
//!                                           │
//!      SWAP ─────────────── use_proxy(new) ─┘ (cookies survive the swap)
//! ```
//!
//! ## Rules
//! - Sessions never follow redirects; `Location` is surfaced in [`HttpResponse::location`].
//! - Relative targets are resolved against the store base URL.
//! - Every failure is a [`FetchError`] carrying a [`TransportKind`](crate::error::TransportKind).

mod client;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::FetchError;
use crate::model::Store;
use crate::services::Proxy;

pub use client::ReqwestConnector;
pub use reqwest::Method;

/// Request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded`, already encoded.
    Form(String),
    Json(Value),
}

/// Outbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Absolute URL or path relative to the store.
    pub target: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::PATCH, target)
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn form(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Form(body.into());
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Body::Json(body);
        self
    }
}

/// Response as seen by handlers.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// `Location` header of a redirect.
    pub location: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    /// Decodes the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// A cookie-keeping HTTP session bound to one store.
#[async_trait]
pub trait HttpSession: Send + Sync {
    /// Routes subsequent requests through `proxy` (`None` = direct).
    fn use_proxy(&mut self, proxy: Option<&Proxy>) -> Result<(), FetchError>;

    /// Sends a request without following redirects.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError>;
}

/// Factory for sessions.
pub trait Connector: Send + Sync + 'static {
    fn session(
        &self,
        store: &Store,
        proxy: Option<&Proxy>,
    ) -> Result<Box<dyn HttpSession>, FetchError>;
}
