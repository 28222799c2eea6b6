//! Payment: gateway, card session, submission, confirmation.

use serde_json::Value;

use crate::classify::Fallback;
use crate::error::TaskError;
use crate::http::{HttpRequest, HttpResponse};
use crate::model::Mode;
use crate::services::{OrderRef, StoreRef, WebhookRecord};
use crate::task::engine::{CheckoutTask, Reply};
use crate::task::forms;
use crate::task::mode::TOKEN_HEADER;
use crate::task::state::State;
use crate::task::table::{
    COMPLETE_PAYMENT_REDIRECTS, COMPLETE_PAYMENT_STEPS, PAYMENT_BODY, PAYMENT_REDIRECTS,
    SUBMIT_PAYMENT_BODY, SUBMIT_PAYMENT_REDIRECTS, SUBMIT_PAYMENT_STEPS,
};

/// What a payment poll says about the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    Pending,
    Success(Option<OrderRef>),
    Declined(String),
}

/// Reads the wallet payments response (or a thank-you redirect).
pub(crate) fn payment_outcome(resp: &HttpResponse) -> Outcome {
    if resp
        .location
        .as_deref()
        .is_some_and(|l| l.contains("thank_you"))
    {
        return Outcome::Success(None);
    }
    let Ok(body) = resp.json::<Value>() else {
        return Outcome::Pending;
    };
    let Some(payment) = body["payments"].as_array().and_then(|p| p.first()) else {
        return Outcome::Pending;
    };
    if let Some(reason) = payment["payment_processing_error_message"].as_str() {
        return Outcome::Declined(reason.to_string());
    }
    match payment["transaction"]["status"].as_str() {
        Some("success") => {
            let order = &payment["checkout"]["order"];
            let number = match &order["id"] {
                Value::Number(n) => Some(n.to_string()),
                Value::String(s) => Some(s.clone()),
                _ => None,
            };
            let url = order["status_url"].as_str().unwrap_or_default().to_string();
            Outcome::Success(number.map(|number| OrderRef { number, url }))
        }
        Some("failure") | Some("error") => Outcome::Declined(
            payment["transaction"]["message"]
                .as_str()
                .unwrap_or("Card declined")
                .to_string(),
        ),
        _ => Outcome::Pending,
    }
}

/// `Shopify.Checkout.step` of a page, or `checkout.step` of a wallet response.
fn page_step(body: &str) -> String {
    forms::checkout_step(body)
        .or_else(|| {
            serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v["checkout"]["step"].as_str().map(str::to_string))
        })
        .unwrap_or_default()
}

impl CheckoutTask {
    pub(in crate::task) async fn go_to_payment(&mut self) -> Result<State, TaskError> {
        let Some(url) = self.ck.url() else {
            return Ok(State::CreateCheckout);
        };
        self.say("Going to payment");
        let target = format!("{url}?previous_step=shipping_method&step=payment_method");
        let fallback = Fallback {
            next: State::GoToPayment,
            message: "Going to payment",
        };
        let resp = match self
            .request(HttpRequest::get(target), fallback, Some(&*PAYMENT_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };
        if !resp.is_success() {
            self.pause_error().await?;
            return Ok(State::GoToPayment);
        }
        if let Some(next) = self.consult(&PAYMENT_BODY, &resp.body).await? {
            return Ok(next);
        }

        if let Some(gateway) = forms::payment_gateway(&resp.body) {
            self.ck.gateway = Some(gateway);
        }
        if self.ck.gateway.is_none() {
            self.say("No payment gateway");
            self.pause_error().await?;
            return Ok(State::GoToPayment);
        }
        let hash = self.ck.hash.clone().unwrap_or_default();
        let config = self.config();
        self.ck.form = forms::checkout_form(&resp.body, State::GoToPayment, &hash, &config.profile);

        if self.ck.payment_token.is_some() {
            self.say("Submitting payment");
            Ok(State::SubmitPayment)
        } else {
            Ok(State::PaymentToken)
        }
    }

    /// Vaults the card and keeps the returned session id.
    pub(in crate::task) async fn payment_token(&mut self) -> Result<State, TaskError> {
        let config = self.config();
        let payment = &config.profile.payment;
        let Some(card) = forms::card_session(payment, &payment.card_holder) else {
            self.say("Invalid card expiry");
            return Ok(State::Error);
        };
        self.say("Getting payment token");
        let req = HttpRequest::post(self.deps.settings.vault_url.clone()).json(card);
        let fallback = Fallback {
            next: State::PaymentToken,
            message: "Getting payment token",
        };
        let resp = match self.request(req, fallback, None).await? {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };

        let session = resp
            .json::<Value>()
            .ok()
            .and_then(|v| v["id"].as_str().map(str::to_string));
        match session {
            Some(id) if resp.is_success() => {
                self.ck.payment_token = Some(id);
                self.say("Submitting payment");
                Ok(State::SubmitPayment)
            }
            _ => {
                self.say(format!("Getting payment token ({})", resp.status));
                self.pause_error().await?;
                Ok(State::PaymentToken)
            }
        }
    }

    pub(in crate::task) async fn submit_payment(&mut self) -> Result<State, TaskError> {
        let Some(url) = self.ck.url() else {
            return Ok(State::CreateCheckout);
        };
        let Some(session) = self.ck.payment_token.clone() else {
            return Ok(State::PaymentToken);
        };
        let config = self.config();
        let strategy = self.strategy();
        let api = strategy.mode == Mode::Api;
        let gateway = match self.ck.gateway.clone() {
            Some(gateway) => gateway,
            None if api => String::new(),
            None => return Ok(State::GoToPayment),
        };
        let rate_id = self.ck.rate.as_ref().map(|r| r.id.clone());
        let captcha = self.ctx.captcha_token.clone();
        let req = strategy.submit_payment(
            self.target(&url),
            &config.profile,
            &session,
            &gateway,
            rate_id.as_deref(),
            captcha.as_deref(),
        );
        self.say("Submitting payment");
        let fallback = Fallback {
            next: State::SubmitPayment,
            message: "Submitting payment",
        };
        let resp = match self
            .request(req, fallback, Some(&*SUBMIT_PAYMENT_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };

        if let Some(next) = self.consult(&SUBMIT_PAYMENT_BODY, &resp.body).await? {
            if next == State::GoToPayment {
                self.ck.payment_token = None;
            }
            return Ok(next);
        }
        let wants_captcha = forms::wants_captcha(&resp.body) || (api && config.captcha);
        if wants_captcha && self.ctx.captcha_token.is_none() {
            self.say("Waiting for captcha");
            return Ok(State::Captcha);
        }
        let step = page_step(&resp.body);
        if let Some(next) = self.consult(&SUBMIT_PAYMENT_STEPS, &step).await? {
            return Ok(next);
        }
        self.pause_error().await?;
        Ok(State::SubmitPayment)
    }

    pub(in crate::task) async fn complete_payment(&mut self) -> Result<State, TaskError> {
        let Some(url) = self.ck.url() else {
            return Ok(State::CreateCheckout);
        };
        let captcha = self.ctx.captcha_token.clone();
        let req = self
            .strategy()
            .complete_payment(self.target(&url), captcha.as_deref());
        self.say("Completing payment");
        let fallback = Fallback {
            next: State::CompletePayment,
            message: "Completing payment",
        };
        let resp = match self
            .request(req, fallback, Some(&*COMPLETE_PAYMENT_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };

        if self.ctx.captcha_token.is_none() && forms::wants_captcha(&resp.body) {
            self.say("Waiting for captcha");
            return Ok(State::Captcha);
        }
        let step = page_step(&resp.body);
        match self.consult(&COMPLETE_PAYMENT_STEPS, &step).await? {
            Some(State::CompletePayment) | None => {
                self.pause_error().await?;
                Ok(State::CompletePayment)
            }
            Some(next) => Ok(next),
        }
    }

    /// Polls the order; one webhook per outcome kind, at most one success.
    pub(in crate::task) async fn process_payment(&mut self) -> Result<State, TaskError> {
        let Some(hash) = self.ck.hash.clone() else {
            return Ok(State::CreateCheckout);
        };
        self.say("Processing payment");
        let mut req = HttpRequest::get(format!("/wallets/checkouts/{hash}/payments"));
        if let Some(token) = &self.ck.access_token {
            req = req.header(TOKEN_HEADER, token.clone());
        }
        let fallback = Fallback {
            next: State::ProcessPayment,
            message: "Processing payment",
        };
        let resp = match self.request(req, fallback, None).await? {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };

        match payment_outcome(&resp) {
            Outcome::Pending => {
                let delay = self.deps.settings.stock_poll;
                self.pause(delay).await?;
                Ok(State::ProcessPayment)
            }
            Outcome::Success(order) => {
                if !self.ck.webhook_sent {
                    self.ck.webhook_sent = true;
                    self.notify(true, order).await;
                }
                tracing::info!("order confirmed");
                self.report_outcome(true);
                self.say("Check email!");
                Ok(State::Done)
            }
            Outcome::Declined(reason) => {
                if !self.ck.webhook_sent && !self.ck.failure_sent {
                    self.ck.failure_sent = true;
                    self.notify(false, None).await;
                }
                tracing::info!(reason = %reason, "payment declined");
                self.ck.payment_token = None;
                self.report_outcome(false);
                self.say(format!("Payment failed: {reason}"));
                Ok(self.strategy().payment_rewind)
            }
        }
    }

    async fn notify(&self, success: bool, order: Option<OrderRef>) {
        let config = self.config();
        let product = self.ck.product.as_deref();
        let pick = self.ck.pick.as_ref();
        let price = product
            .zip(pick)
            .and_then(|(p, pick)| p.variants.iter().find(|v| v.id == pick.id))
            .map(|v| v.price.clone())
            .unwrap_or_default();
        let record = WebhookRecord {
            success,
            checkout_url: format!(
                "{}{}",
                config.store.base(),
                self.ck.url().unwrap_or_default()
            ),
            product: product.map(|p| p.title.clone()).unwrap_or_default(),
            price,
            store: StoreRef {
                name: config.store.name.clone(),
                url: config.store.base().to_string(),
            },
            order,
            profile: config.profile.name.clone(),
            size: pick.map(|p| p.size.clone()).unwrap_or_default(),
            image: product.and_then(|p| p.image.clone()),
            mode: config.mode,
        };
        self.deps.webhooks.insert(record).await;
        tokio::select! {
            _ = self.ctx.cancel.cancelled() => {
                tracing::warn!(success, "webhook flush interrupted by stop");
            }
            _ = self.deps.webhooks.send() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(json: &str) -> HttpResponse {
        HttpResponse::new(200).with_body(json)
    }

    #[test]
    fn test_payment_outcomes() {
        assert_eq!(payment_outcome(&body("{}")), Outcome::Pending);
        assert_eq!(payment_outcome(&body("not json")), Outcome::Pending);
        assert_eq!(
            payment_outcome(&body(r#"{"payments":[{"transaction":null}]}"#)),
            Outcome::Pending
        );
        assert_eq!(
            payment_outcome(&body(
                r#"{"payments":[{"transaction":{"status":"success"},
                    "checkout":{"order":{"id":1001,"status_url":"https://s/o/1001"}}}]}"#
            )),
            Outcome::Success(Some(OrderRef {
                number: "1001".into(),
                url: "https://s/o/1001".into(),
            }))
        );
        assert_eq!(
            payment_outcome(&body(
                r#"{"payments":[{"payment_processing_error_message":"Card declined","transaction":{"status":"failure"}}]}"#
            )),
            Outcome::Declined("Card declined".into())
        );
        assert_eq!(
            payment_outcome(&HttpResponse::new(302).with_location("/1/checkouts/h/thank_you")),
            Outcome::Success(None)
        );
    }

    #[test]
    fn test_page_step_reads_html_and_json() {
        assert_eq!(page_step(r#"Shopify.Checkout.step = "review";"#), "review");
        assert_eq!(page_step(r#"{"checkout":{"step":"payment_method"}}"#), "payment_method");
        assert_eq!(page_step(""), "");
    }
}
