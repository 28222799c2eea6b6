//! Scripted collaborators for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{FetchError, ParseError};
use crate::http::{Connector, HttpRequest, HttpResponse, HttpSession};
use crate::model::{Platform, Store};
use crate::monitor::{Parser, ParserFactory, Product, ProductMatcher, Variant};
use crate::services::{Proxy, WebhookManager, WebhookRecord};

#[derive(Default)]
struct Script {
    replies: VecDeque<Result<HttpResponse, FetchError>>,
    requests: Vec<HttpRequest>,
    proxies: Vec<Option<String>>,
}

/// Session answering from a queue of canned replies.
///
/// Clones share the script. Once the queue is empty `send` never resolves,
/// so only cancellation ends the caller.
#[derive(Clone, Default)]
pub(crate) struct ScriptedSession {
    script: Arc<Mutex<Script>>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, resp: HttpResponse) {
        self.script.lock().unwrap().replies.push_back(Ok(resp));
    }

    pub fn push_err(&self, err: FetchError) {
        self.script.lock().unwrap().replies.push_back(Err(err));
    }

    /// Requests sent so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.script.lock().unwrap().requests.clone()
    }

    /// Proxy URL of every session opening and proxy change.
    pub fn proxies(&self) -> Vec<Option<String>> {
        self.script.lock().unwrap().proxies.clone()
    }

    fn record_proxy(&self, proxy: Option<&Proxy>) {
        self.script
            .lock()
            .unwrap()
            .proxies
            .push(proxy.map(|p| p.url.clone()));
    }
}

#[async_trait]
impl HttpSession for ScriptedSession {
    fn use_proxy(&mut self, proxy: Option<&Proxy>) -> Result<(), FetchError> {
        self.record_proxy(proxy);
        Ok(())
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let reply = {
            let mut script = self.script.lock().unwrap();
            script.requests.push(request);
            script.replies.pop_front()
        };
        match reply {
            Some(reply) => reply,
            None => futures::future::pending().await,
        }
    }
}

/// Connector handing out clones of one scripted session.
pub(crate) struct ScriptedConnector {
    session: ScriptedSession,
}

impl ScriptedConnector {
    pub fn new(session: ScriptedSession) -> Self {
        Self { session }
    }
}

impl Connector for ScriptedConnector {
    fn session(
        &self,
        _store: &Store,
        proxy: Option<&Proxy>,
    ) -> Result<Box<dyn HttpSession>, FetchError> {
        self.session.record_proxy(proxy);
        Ok(Box::new(self.session.clone()))
    }
}

pub(crate) fn product() -> Product {
    Product {
        id: "2".into(),
        title: "Yeezy Boost 350".into(),
        handle: "yb".into(),
        url: "https://shop.example.com/products/yb".into(),
        image: Some("https://cdn.example.com/yb.png".into()),
        variants: vec![Variant {
            id: "21".into(),
            title: "10".into(),
            options: vec!["10".into()],
            available: true,
            price: "220.00".into(),
        }],
    }
}

struct StubParser(Option<Product>);

#[async_trait]
impl Parser for StubParser {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn run(
        &self,
        _session: &dyn HttpSession,
        _store: &Store,
        _matcher: &ProductMatcher,
    ) -> Result<Product, ParseError> {
        self.0.clone().ok_or(ParseError::NotFound)
    }
}

/// Parser factory resolving every matcher without I/O.
pub(crate) struct StubParsers(Option<Product>);

impl StubParsers {
    pub fn found() -> Self {
        Self(Some(product()))
    }

    pub fn missing() -> Self {
        Self(None)
    }
}

impl ParserFactory for StubParsers {
    fn parsers(&self, _platform: Platform, _matcher: &ProductMatcher) -> Vec<Box<dyn Parser>> {
        vec![Box::new(StubParser(self.0.clone()))]
    }
}

/// Webhook sink keeping what it was given.
#[derive(Default)]
pub(crate) struct RecordingWebhooks {
    records: Mutex<Vec<WebhookRecord>>,
    flushes: Mutex<usize>,
}

impl RecordingWebhooks {
    pub fn records(&self) -> Vec<WebhookRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn flushes(&self) -> usize {
        *self.flushes.lock().unwrap()
    }
}

#[async_trait]
impl WebhookManager for RecordingWebhooks {
    async fn insert(&self, record: WebhookRecord) {
        self.records.lock().unwrap().push(record);
    }

    async fn send(&self) {
        *self.flushes.lock().unwrap() += 1;
    }
}
