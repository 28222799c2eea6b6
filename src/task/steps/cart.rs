//! Cart, checkout creation and the queue.

use crate::classify::Fallback;
use crate::error::TaskError;
use crate::http::HttpRequest;
use crate::task::engine::{CheckoutTask, Reply};
use crate::task::forms;
use crate::task::state::State;
use crate::task::table::{ADD_TO_CART_REDIRECTS, CART_REDIRECTS, CREATE_CHECKOUT_REDIRECTS};

impl CheckoutTask {
    pub(in crate::task) async fn add_to_cart(&mut self) -> Result<State, TaskError> {
        let Some(pick) = self.ck.pick.clone() else {
            return Ok(State::WaitForProduct);
        };
        self.say("Adding to cart");
        let req = self.strategy().add_to_cart(&pick.id);
        let fallback = Fallback {
            next: State::AddToCart,
            message: "Adding to cart",
        };
        let resp = match self
            .request(req, fallback, Some(&*ADD_TO_CART_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };

        if resp.is_success() {
            self.say("Added to cart");
            return Ok(self.strategy().after_cart);
        }
        let body = resp.body.to_ascii_lowercase();
        if body.contains("sold out") {
            let delay = self.delays().monitor;
            self.say(format!("Out of stock! Delaying {}ms", delay.as_millis()));
            self.pause(delay).await?;
            return Ok(State::AddToCart);
        }
        if body.contains("cannot find variant") || resp.status == 404 {
            self.say("Invalid variant");
            self.ck.pick = None;
            self.pause_error().await?;
            return Ok(State::WaitForProduct);
        }
        self.say(format!("Adding to cart ({})", resp.status));
        self.pause_error().await?;
        Ok(State::AddToCart)
    }

    pub(in crate::task) async fn go_to_cart(&mut self) -> Result<State, TaskError> {
        self.say("Going to cart");
        let fallback = Fallback {
            next: State::GoToCart,
            message: "Going to cart",
        };
        let resp = match self
            .request(HttpRequest::get("/cart"), fallback, Some(&*CART_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };
        if !resp.is_success() {
            self.pause_error().await?;
            return Ok(State::GoToCart);
        }

        let body = resp.body.to_ascii_lowercase();
        if body.contains("cart--empty") || body.contains("your cart is currently empty") {
            self.say("Cart empty");
            return Ok(State::AddToCart);
        }
        self.ck.cart = forms::cart_form(&resp.body);
        self.say("Creating checkout");
        Ok(State::CreateCheckout)
    }

    pub(in crate::task) async fn create_checkout(&mut self) -> Result<State, TaskError> {
        self.say("Creating checkout");
        let req = self.strategy().create_checkout(&self.ck.cart);
        let fallback = Fallback {
            next: State::CreateCheckout,
            message: "Creating checkout",
        };
        match self
            .request(req, fallback, Some(&*CREATE_CHECKOUT_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => Ok(next),
            Reply::Proceed(_) | Reply::Response(_) => {
                self.pause_error().await?;
                Ok(State::CreateCheckout)
            }
        }
    }

    /// Polls the queue until a checkout redirect or link shows up, then
    /// resumes where the queue interrupted the funnel.
    pub(in crate::task) async fn queue(&mut self) -> Result<State, TaskError> {
        self.say("Polling queue");
        self.ck.admitted = false;
        let target = match &self.ck.ctd {
            Some(ctd) => format!(
                "/throttle/queue?{}&_ctd_update=",
                forms::encode(&[("_ctd".to_string(), ctd.clone())])
            ),
            None => "/checkout/poll?js_poll=1".to_string(),
        };
        let fallback = Fallback {
            next: State::Queue,
            message: "Polling queue",
        };
        let reply = self.request(HttpRequest::get(target), fallback, None).await?;

        if let Reply::Proceed(resp) | Reply::Response(resp) = &reply {
            let found = forms::checkout_href(&resp.body).and_then(|href| forms::checkout_ids(&href));
            if let Some((store_id, hash)) = found {
                self.ck.store_id = Some(store_id);
                self.ck.hash = Some(hash);
                self.ck.admitted = true;
            }
        }

        if self.ck.admitted {
            let origin = self.origins.queue.unwrap_or(self.prev);
            let force_captcha = self.config().captcha;
            let next = self
                .strategy()
                .queue_resume(origin, self.ck.rate.is_some(), force_captcha);
            tracing::info!(origin = %origin, next = %next, "passed queue");
            self.say("Passed queue");
            return Ok(next);
        }
        match reply {
            Reply::Moved(next) => Ok(next),
            Reply::Proceed(_) | Reply::Response(_) => {
                let delay = self.deps.settings.queue_poll;
                self.pause(delay).await?;
                Ok(State::Queue)
            }
        }
    }
}
