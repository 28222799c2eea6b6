//! Checkout page, customer information and shipping.

use crate::classify::Fallback;
use crate::error::TaskError;
use crate::http::HttpRequest;
use crate::model::{Mode, ShippingRate};
use crate::task::engine::{CheckoutTask, Reply};
use crate::task::forms;
use crate::task::rates::cheapest_rate;
use crate::task::state::State;
use crate::task::table::{
    CHECKOUT_BODY, CHECKOUT_REDIRECTS, CHECKOUT_STEPS, SHIPPING_BODY, SHIPPING_REDIRECTS,
    SUBMIT_CUSTOMER_REDIRECTS, SUBMIT_SHIPPING_BODY, SUBMIT_SHIPPING_REDIRECTS,
};

impl CheckoutTask {
    /// Scrapes the protected form of the current page, if it has one.
    fn protected_form(&self) -> Option<forms::Fields> {
        let form = &self.ck.form;
        (form.protected && !form.fields.is_empty()).then(|| form.fields.clone())
    }

    fn scrape_form(&mut self, html: &str, state: State) {
        let hash = self.ck.hash.clone().unwrap_or_default();
        let config = self.config();
        self.ck.form = forms::checkout_form(html, state, &hash, &config.profile);
    }

    pub(in crate::task) async fn go_to_checkout(&mut self) -> Result<State, TaskError> {
        let Some(url) = self.ck.url() else {
            self.say("Creating checkout");
            return Ok(State::CreateCheckout);
        };
        self.say("Going to checkout");
        let fallback = Fallback {
            next: State::GoToCheckout,
            message: "Going to checkout",
        };
        let resp = match self
            .request(HttpRequest::get(url), fallback, Some(&*CHECKOUT_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };
        if !resp.is_success() {
            self.say(format!("Going to checkout ({})", resp.status));
            self.pause_error().await?;
            return Ok(State::GoToCheckout);
        }
        if let Some(next) = self.consult(&CHECKOUT_BODY, &resp.body).await? {
            return Ok(next);
        }

        if let Some(key) = forms::sitekey(&resp.body) {
            self.ck.sitekey = Some(key);
        }
        if let Some(gateway) = forms::payment_gateway(&resp.body) {
            self.ck.gateway = Some(gateway);
        }
        self.scrape_form(&resp.body, State::GoToCheckout);

        let step = forms::checkout_step(&resp.body).unwrap_or_default();
        let wants_captcha = self.config().captcha || forms::wants_captcha(&resp.body);
        if wants_captcha
            && self.ctx.captcha_token.is_none()
            && (step.is_empty() || step.contains("contact"))
        {
            self.say("Waiting for captcha");
            return Ok(State::Captcha);
        }
        if let Some(next) = self.consult(&CHECKOUT_STEPS, &step).await? {
            return Ok(next);
        }
        self.say("Submitting information");
        Ok(State::SubmitCustomer)
    }

    pub(in crate::task) async fn submit_customer(&mut self) -> Result<State, TaskError> {
        let Some(url) = self.ck.url() else {
            return Ok(State::CreateCheckout);
        };
        let config = self.config();
        let strategy = self.strategy();
        let captcha = self.ctx.captcha_token.clone();
        let form = self.protected_form();
        let req = strategy.submit_customer(
            self.target(&url),
            self.ck.setup,
            &config.profile,
            form.as_ref(),
            captcha.as_deref(),
        );
        self.say("Submitting information");
        let fallback = Fallback {
            next: State::SubmitCustomer,
            message: "Submitting information",
        };

        if strategy.mode == Mode::Api && !self.ck.setup {
            let resp = match self.request(req, fallback, None).await? {
                Reply::Moved(next) => return Ok(next),
                Reply::Proceed(resp) | Reply::Response(resp) => resp,
            };
            let has_address = resp
                .json::<serde_json::Value>()
                .is_ok_and(|v| !v["checkout"]["shipping_address"].is_null());
            if resp.is_success() && has_address {
                self.ck.setup = true;
                self.ctx.captcha_token = None;
                self.say("Checkout ready");
                return Ok(State::WaitForProduct);
            }
            self.say(format!("Submitting information ({})", resp.status));
            self.pause_error().await?;
            return Ok(State::SubmitCustomer);
        }

        match self
            .request(req, fallback, Some(&*SUBMIT_CUSTOMER_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => Ok(next),
            Reply::Proceed(_) => {
                self.ctx.captcha_token = None;
                if self.ck.rate.is_some() {
                    Ok(State::SubmitShipping)
                } else {
                    Ok(State::GoToShipping)
                }
            }
            Reply::Response(resp) => {
                if self.ctx.captcha_token.is_none() && forms::wants_captcha(&resp.body) {
                    self.say("Waiting for captcha");
                    return Ok(State::Captcha);
                }
                self.pause_error().await?;
                Ok(State::SubmitCustomer)
            }
        }
    }

    pub(in crate::task) async fn go_to_shipping(&mut self) -> Result<State, TaskError> {
        let Some(url) = self.ck.url() else {
            return Ok(State::CreateCheckout);
        };
        if self.ck.rate.is_some() {
            return Ok(self.strategy().after_rate);
        }
        self.say("Fetching rates");
        let target = format!("{url}?previous_step=contact_information&step=shipping_method");
        let fallback = Fallback {
            next: State::GoToShipping,
            message: "Fetching rates",
        };
        let resp = match self
            .request(HttpRequest::get(target), fallback, Some(&*SHIPPING_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };
        if !resp.is_success() {
            self.pause_error().await?;
            return Ok(State::GoToShipping);
        }
        if let Some(next) = self.consult(&SHIPPING_BODY, &resp.body).await? {
            return Ok(next);
        }

        if let Some(id) = forms::shipping_method(&resp.body) {
            self.scrape_form(&resp.body, State::GoToShipping);
            self.ck.rate = Some(ShippingRate {
                name: id.clone(),
                id,
                price: String::new(),
            });
            if self.ck.form.protected
                && self.ctx.captcha_token.is_none()
                && forms::wants_captcha(&resp.body)
            {
                self.say("Waiting for captcha");
                return Ok(State::Captcha);
            }
            self.say("Rate found");
            return Ok(self.strategy().after_rate);
        }
        if resp.body.contains("stock_problems") {
            return self.fetch_cart_rates().await;
        }
        let delay = self.deps.settings.stock_poll;
        self.pause(delay).await?;
        Ok(State::GoToShipping)
    }

    /// Picks the cheapest rate from the cart rates endpoint.
    async fn fetch_cart_rates(&mut self) -> Result<State, TaskError> {
        let query = forms::rates_query(&self.config().profile.shipping);
        let fallback = Fallback {
            next: State::GoToShipping,
            message: "Fetching rates",
        };
        let req = HttpRequest::get(format!("/cart/shipping_rates.json?{query}"));
        let resp = match self.request(req, fallback, None).await? {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };
        match cheapest_rate(&resp.body) {
            Some(rate) if resp.is_success() => {
                tracing::debug!(rate = %rate.id, price = %rate.price, "cart rate selected");
                self.ck.rate = Some(rate);
                self.say("Rate found");
                Ok(self.strategy().after_rate)
            }
            _ => {
                self.say("No shipping rates");
                self.pause_error().await?;
                Ok(State::GoToShipping)
            }
        }
    }

    pub(in crate::task) async fn submit_shipping(&mut self) -> Result<State, TaskError> {
        let Some(url) = self.ck.url() else {
            return Ok(State::CreateCheckout);
        };
        let Some(rate) = self.ck.rate.clone() else {
            return Ok(State::GoToShipping);
        };
        // the wallet payment carries the rate itself
        if self.strategy().mode == Mode::Api {
            return Ok(State::PaymentToken);
        }

        let mut form = self.protected_form();
        if let (Some(fields), Some(token)) = (form.as_mut(), self.ctx.captcha_token.as_deref()) {
            forms::upsert_after(fields, "authenticity_token", "g-recaptcha-response", token);
        }
        let req = self.strategy().submit_shipping(&url, &rate.id, form.as_ref());
        self.say("Submitting shipping");
        let fallback = Fallback {
            next: State::SubmitShipping,
            message: "Submitting shipping",
        };
        match self
            .request(req, fallback, Some(&*SUBMIT_SHIPPING_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => Ok(next),
            Reply::Proceed(_) => Ok(State::GoToPayment),
            Reply::Response(resp) => {
                if let Some(next) = self.consult(&SUBMIT_SHIPPING_BODY, &resp.body).await? {
                    return Ok(next);
                }
                if self.ctx.captcha_token.is_none() && forms::wants_captcha(&resp.body) {
                    self.say("Waiting for captcha");
                    return Ok(State::Captcha);
                }
                self.pause_error().await?;
                Ok(State::SubmitShipping)
            }
        }
    }
}
