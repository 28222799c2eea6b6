//! # Rate fetcher.
//!
//! A reduced task that resolves the product itself, adds it to the cart and
//! caches the cheapest shipping rate for (profile, store). Checkout tasks
//! started later for the same pair skip rate fetching.
//!
//! ```text
//! PARSE ──► CART ──► RATES ──► DONE
//!   │         │        │
//!   └─────────┴────────┴──► ERROR (no size, invalid variant, unsupported country)
//! ```
//!
//! Transport failures and statuses go through the same classifier as the
//! checkout engine: ban and reset swap the proxy, everything else retries the
//! phase after the error delay.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use tokio::select;
use tracing::Instrument;

use super::engine::TaskDeps;
use super::forms;
use super::mode::FRONTEND;
use super::state::State;
use crate::classify::{Fallback, Signal, classify};
use crate::context::Context;
use crate::error::{ParseError, TaskError};
use crate::http::{HttpRequest, HttpResponse, HttpSession};
use crate::model::ShippingRate;
use crate::monitor::{Pick, pick_variant, race};

#[derive(Debug, Deserialize)]
struct CartRates {
    #[serde(default)]
    shipping_rates: Vec<CartRate>,
}

#[derive(Debug, Deserialize)]
struct CartRate {
    name: String,
    #[serde(default)]
    code: Option<String>,
    price: String,
    #[serde(default)]
    source: Option<String>,
}

impl From<CartRate> for ShippingRate {
    fn from(rate: CartRate) -> Self {
        let source = rate.source.as_deref().unwrap_or("shopify");
        let code = rate.code.as_deref().unwrap_or(&rate.name).replace(' ', "%20");
        ShippingRate {
            id: format!("{source}-{code}-{}", rate.price),
            name: rate.name,
            price: rate.price,
        }
    }
}

/// Rates listed by `/cart/shipping_rates.json`; `None` if the body is not that document.
pub(crate) fn parse_rates(body: &str) -> Option<Vec<ShippingRate>> {
    let rates: CartRates = serde_json::from_str(body).ok()?;
    Some(rates.shipping_rates.into_iter().map(ShippingRate::from).collect())
}

pub(crate) fn cheapest_rate(body: &str) -> Option<ShippingRate> {
    parse_rates(body)?
        .into_iter()
        .min_by(|a, b| a.price_value().total_cmp(&b.price_value()))
}

/// Rate fetcher phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Parse,
    Cart,
    Rates,
    Done,
    Error,
    Abort,
}

impl Phase {
    /// Checkout state reported in status events.
    pub fn as_state(&self) -> State {
        match self {
            Phase::Parse => State::WaitForProduct,
            Phase::Cart => State::AddToCart,
            Phase::Rates => State::GoToShipping,
            Phase::Done => State::Done,
            Phase::Error => State::Error,
            Phase::Abort => State::Abort,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Error | Phase::Abort)
    }
}

enum Sent {
    Response(HttpResponse),
    Retry(Phase),
}

pub struct RateFetcher {
    ctx: Context,
    deps: TaskDeps,
    session: Box<dyn HttpSession>,
    phase: Phase,
    pick: Option<Pick>,
    found: Option<ShippingRate>,
    swaps: u32,
}

impl RateFetcher {
    pub fn new(ctx: Context, deps: TaskDeps) -> Result<Self, TaskError> {
        let config = ctx.config();
        let session = deps.connector.session(&config.store, ctx.proxy.as_ref())?;
        Ok(Self {
            ctx,
            deps,
            session,
            phase: Phase::Parse,
            pick: None,
            found: None,
            swaps: 0,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs to a terminal phase; returns it as a checkout state.
    pub async fn run(self) -> State {
        let span = self.ctx.span.clone();
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> State {
        tracing::info!("rate fetcher started");
        while !self.phase.is_terminal() {
            let next = if self.ctx.is_cancelled() {
                Phase::Abort
            } else {
                match AssertUnwindSafe(self.step()).catch_unwind().await {
                    Ok(Ok(next)) => next,
                    Ok(Err(TaskError::Canceled)) => Phase::Abort,
                    Ok(Err(err)) => {
                        tracing::warn!(error = %err, "rate fetcher failed");
                        self.say(err.as_message());
                        Phase::Error
                    }
                    Err(_) => {
                        tracing::error!("rate fetcher panicked");
                        Phase::Error
                    }
                }
            };
            self.phase = next;
        }

        let state = self.phase.as_state();
        let found = self.found.take();
        self.ctx.emit(|ev| {
            let ev = ev.with_state(state);
            match found {
                Some(rate) => ev.with_message("Rates found!").with_rate(rate),
                None if state == State::Abort => ev.with_message("Stopped"),
                None => ev,
            }
        });
        if let Some(proxy) = self.ctx.proxy.take() {
            let config = self.ctx.config();
            self.deps
                .proxies
                .release(&self.ctx.id, config.store.base(), config.platform, &proxy.id)
                .await;
        }
        tracing::info!(state = %state, "rate fetcher finished");
        state
    }

    fn say(&self, message: impl Into<Arc<str>>) {
        let message = message.into();
        let state = self.phase.as_state();
        self.ctx.emit(|ev| ev.with_state(state).with_message(message));
    }

    async fn pause(&self, delay: std::time::Duration) -> Result<(), TaskError> {
        if self.ctx.wait(delay).await {
            Ok(())
        } else {
            Err(TaskError::Canceled)
        }
    }

    async fn step(&mut self) -> Result<Phase, TaskError> {
        match self.phase {
            Phase::Parse => self.parse().await,
            Phase::Cart => self.cart().await,
            Phase::Rates => self.rates().await,
            terminal => Ok(terminal),
        }
    }

    async fn parse(&mut self) -> Result<Phase, TaskError> {
        self.say("Parsing products");
        let config = self.ctx.config();
        let parsers = self.deps.parsers.parsers(config.platform, &config.product);
        let result = select! {
            _ = self.ctx.cancel.cancelled() => return Err(TaskError::Canceled),
            result = race(&parsers, self.session.as_ref(), &config.store, &config.product) => result,
        };

        let err = match result {
            Ok(product) => {
                return match pick_variant(&product.variants, &config.size, config.random_in_stock) {
                    Some(pick) => {
                        self.say(format!("Product found: {}", product.title));
                        self.pick = Some(pick);
                        Ok(Phase::Cart)
                    }
                    None => {
                        self.say("No size matched! Stopping...");
                        Ok(Phase::Error)
                    }
                };
            }
            Err(err) => err,
        };

        let signal = match &err {
            ParseError::Fetch(f) => Some(Signal::transport(f.kind())),
            ParseError::Status { status } => Some(Signal::status(*status)),
            _ => None,
        };
        if let Some(signal) = signal {
            if let Some(phase) = self.recover(signal, Phase::Parse, "Parsing products").await? {
                return Ok(phase);
            }
        }
        let delay = config.delays.monitor;
        self.say(format!("No product found. Delaying {}ms", delay.as_millis()));
        self.pause(delay).await?;
        Ok(Phase::Parse)
    }

    async fn cart(&mut self) -> Result<Phase, TaskError> {
        let Some(pick) = self.pick.clone() else {
            return Ok(Phase::Parse);
        };
        self.say("Adding to cart");
        let resp = match self
            .send(FRONTEND.add_to_cart(&pick.id), Phase::Cart, "Adding to cart")
            .await?
        {
            Sent::Retry(phase) => return Ok(phase),
            Sent::Response(resp) => resp,
        };
        if resp.is_success() {
            return Ok(Phase::Rates);
        }
        if matches!(resp.status, 404 | 422) {
            self.say("Invalid variant");
            return Ok(Phase::Error);
        }
        self.pause(self.ctx.config().delays.error).await?;
        Ok(Phase::Cart)
    }

    async fn rates(&mut self) -> Result<Phase, TaskError> {
        self.say("Fetching rates");
        let config = self.ctx.config();
        let query = forms::rates_query(&config.profile.shipping);
        let req = HttpRequest::get(format!("/cart/shipping_rates.json?{query}"));
        let resp = match self.send(req, Phase::Rates, "Fetching rates").await? {
            Sent::Retry(phase) => return Ok(phase),
            Sent::Response(resp) => resp,
        };

        if resp.status == 422 {
            if resp.body.to_ascii_lowercase().contains("empty") {
                self.say("Cart empty");
                return Ok(Phase::Cart);
            }
            self.say("Country not supported / Cart error");
            return Ok(Phase::Error);
        }
        if resp.status == 202 || (resp.is_success() && resp.body.trim().is_empty()) {
            self.say("Polling for rates");
            self.pause(self.deps.settings.stock_poll).await?;
            return Ok(Phase::Rates);
        }
        if !resp.is_success() {
            self.pause(config.delays.error).await?;
            return Ok(Phase::Rates);
        }

        match cheapest_rate(&resp.body) {
            Some(rate) => {
                tracing::info!(rate = %rate.id, price = %rate.price, "shipping rate cached");
                self.deps.rates.insert(&config, rate.clone()).await;
                self.found = Some(rate);
                Ok(Phase::Done)
            }
            None => {
                self.say("No shipping rates");
                Ok(Phase::Error)
            }
        }
    }

    async fn send(&mut self, req: HttpRequest, phase: Phase, message: &str) -> Result<Sent, TaskError> {
        let sent = select! {
            _ = self.ctx.cancel.cancelled() => return Err(TaskError::Canceled),
            sent = self.session.send(req) => sent,
        };
        match sent {
            Ok(resp) => match self.recover(Signal::status(resp.status), phase, message).await? {
                Some(phase) => Ok(Sent::Retry(phase)),
                None => {
                    self.swaps = 0;
                    Ok(Sent::Response(resp))
                }
            },
            Err(err) => match self.recover(Signal::transport(err.kind()), phase, message).await? {
                Some(phase) => Ok(Sent::Retry(phase)),
                None => {
                    self.say(format!("{message} ({})", err.kind().as_label()));
                    self.pause(self.ctx.config().delays.error).await?;
                    Ok(Sent::Retry(phase))
                }
            },
        }
    }

    /// Applies a classifier decision; `None` when the signal is not classified.
    async fn recover(
        &mut self,
        signal: Signal,
        phase: Phase,
        message: &str,
    ) -> Result<Option<Phase>, TaskError> {
        let fallback = Fallback {
            next: phase.as_state(),
            message,
        };
        let Some(t) = classify(&signal, &fallback) else {
            return Ok(None);
        };
        match t.next {
            State::Abort => Err(TaskError::Canceled),
            State::Swap => {
                self.swap().await?;
                Ok(Some(phase))
            }
            _ => {
                if let Some(message) = t.message {
                    self.say(message);
                }
                self.pause(self.ctx.config().delays.error).await?;
                Ok(Some(phase))
            }
        }
    }

    async fn swap(&mut self) -> Result<(), TaskError> {
        let config = self.ctx.config();
        let delay = self.deps.settings.swap_backoff.next(self.swaps);
        self.swaps = self.swaps.saturating_add(1);
        let next = self
            .deps
            .proxies
            .swap(&self.ctx.id, config.store.base(), config.platform, self.ctx.proxy.as_ref())
            .await;
        self.session.use_proxy(next.as_ref())?;
        self.ctx.proxy = next;
        self.say(format!("Proxy banned! Delaying {}ms", delay.as_millis()));
        self.pause(delay).await
    }
}
