//! `reqwest`-backed sessions.

use std::error::Error as _;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::{Client, header, redirect};
use url::Url;

use super::{Body, Connector, HttpRequest, HttpResponse, HttpSession};
use crate::error::{FetchError, TransportKind};
use crate::model::Store;
use crate::services::Proxy;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Builds [`ReqwestSession`]s with a per-request timeout.
#[derive(Debug, Clone)]
pub struct ReqwestConnector {
    timeout: Duration,
}

impl ReqwestConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ReqwestConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl Connector for ReqwestConnector {
    fn session(
        &self,
        store: &Store,
        proxy: Option<&Proxy>,
    ) -> Result<Box<dyn HttpSession>, FetchError> {
        let base = Url::parse(store.base()).map_err(|e| FetchError::InvalidRequest {
            reason: format!("store url {}: {e}", store.url),
        })?;
        let jar = Arc::new(Jar::default());
        let client = build_client(&jar, self.timeout, proxy)?;
        Ok(Box::new(ReqwestSession {
            base,
            jar,
            timeout: self.timeout,
            client,
        }))
    }
}

/// Session keeping one cookie jar across proxy swaps.
pub struct ReqwestSession {
    base: Url,
    jar: Arc<Jar>,
    timeout: Duration,
    client: Client,
}

impl ReqwestSession {
    fn resolve(&self, target: &str) -> Result<Url, FetchError> {
        self.base
            .join(target)
            .map_err(|e| FetchError::InvalidRequest {
                reason: format!("{target}: {e}"),
            })
    }
}

#[async_trait]
impl HttpSession for ReqwestSession {
    fn use_proxy(&mut self, proxy: Option<&Proxy>) -> Result<(), FetchError> {
        self.client = build_client(&self.jar, self.timeout, proxy)?;
        Ok(())
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let url = self.resolve(&request.target)?;
        let mut builder = self.client.request(request.method, url);
        for (name, value) in request.headers {
            builder = builder.header(name, value);
        }
        builder = match request.body {
            Body::Empty => builder,
            Body::Form(encoded) => builder
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded),
            Body::Json(value) => builder.json(&value),
        };

        let response = builder.send().await.map_err(into_fetch_error)?;
        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(into_fetch_error)?;

        Ok(HttpResponse {
            status,
            location,
            body,
        })
    }
}

fn build_client(
    jar: &Arc<Jar>,
    timeout: Duration,
    proxy: Option<&Proxy>,
) -> Result<Client, FetchError> {
    let mut builder = Client::builder()
        .cookie_provider(Arc::clone(jar))
        .redirect(redirect::Policy::none())
        .timeout(timeout)
        .user_agent(USER_AGENT);
    if let Some(proxy) = proxy {
        let p = reqwest::Proxy::all(proxy.url.as_str()).map_err(|e| FetchError::InvalidProxy {
            proxy: proxy.label().to_string(),
            reason: e.to_string(),
        })?;
        builder = builder.proxy(p);
    }
    builder.build().map_err(|e| FetchError::InvalidRequest {
        reason: e.to_string(),
    })
}

fn into_fetch_error(err: reqwest::Error) -> FetchError {
    FetchError::transport(transport_kind(&err), err.to_string())
}

/// Classifies a `reqwest` failure by timeout flag, io error kind, then error text.
pub(crate) fn transport_kind(err: &reqwest::Error) -> TransportKind {
    if err.is_timeout() {
        return TransportKind::Timeout;
    }
    let mut source = err.source();
    while let Some(e) = source {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if let Some(kind) = from_io_kind(io_err.kind()) {
                return kind;
            }
        }
        source = e.source();
    }
    from_text(&format!("{err:?}"))
}

fn from_io_kind(kind: io::ErrorKind) -> Option<TransportKind> {
    match kind {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => Some(TransportKind::Reset),
        io::ErrorKind::ConnectionRefused => Some(TransportKind::Refused),
        io::ErrorKind::TimedOut => Some(TransportKind::Timeout),
        _ => None,
    }
}

fn from_text(text: &str) -> TransportKind {
    let text = text.to_ascii_lowercase();
    if text.contains("dns error") || text.contains("failed to lookup address") {
        TransportKind::HostNotFound
    } else if text.contains("connection reset") || text.contains("econnreset") {
        TransportKind::Reset
    } else if text.contains("connection refused") {
        TransportKind::Refused
    } else if text.contains("timed out") {
        TransportKind::Timeout
    } else {
        TransportKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_kinds() {
        assert_eq!(
            from_io_kind(io::ErrorKind::ConnectionReset),
            Some(TransportKind::Reset)
        );
        assert_eq!(
            from_io_kind(io::ErrorKind::ConnectionRefused),
            Some(TransportKind::Refused)
        );
        assert_eq!(from_io_kind(io::ErrorKind::NotFound), None);
    }

    #[test]
    fn test_text_fallback() {
        assert_eq!(
            from_text("error sending request: dns error: failed to lookup address information"),
            TransportKind::HostNotFound
        );
        assert_eq!(from_text("Connection reset by peer"), TransportKind::Reset);
        assert_eq!(from_text("tls handshake eof"), TransportKind::Other);
    }

    #[test]
    fn test_session_resolves_relative_targets() {
        let store = Store {
            name: "s".into(),
            url: "https://shop.example.com/".into(),
            api_key: None,
        };
        let connector = ReqwestConnector::default();
        assert!(connector.session(&store, None).is_ok());

        let session = ReqwestSession {
            base: Url::parse(store.base()).unwrap(),
            jar: Arc::new(Jar::default()),
            timeout: Duration::from_secs(1),
            client: Client::new(),
        };
        assert_eq!(
            session.resolve("/cart/add.js").unwrap().as_str(),
            "https://shop.example.com/cart/add.js"
        );
        assert_eq!(
            session.resolve("https://other.example.com/x").unwrap().as_str(),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_invalid_store_url() {
        let store = Store {
            name: "s".into(),
            url: "not a url".into(),
            api_key: None,
        };
        let err = ReqwestConnector::default().session(&store, None).err().unwrap();
        assert_eq!(err.as_label(), "fetch_invalid_request");
    }
}
