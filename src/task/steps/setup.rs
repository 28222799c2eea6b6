//! Store preparation: data gathering, login, product wait, checkpoint.

use crate::classify::Fallback;
use crate::error::TaskError;
use crate::http::HttpRequest;
use crate::monitor::pick_variant;
use crate::task::engine::{CheckoutTask, Reply};
use crate::task::forms;
use crate::task::state::State;
use crate::task::table::{
    CHECKPOINT_REDIRECTS, GATHER_REDIRECTS, LOGIN_REDIRECTS, SUBMIT_CHECKPOINT_REDIRECTS,
};

fn ready_message(state: State) -> &'static str {
    match state {
        State::CreateCheckout => "Creating checkout",
        _ => "Waiting for product",
    }
}

impl CheckoutTask {
    pub(in crate::task) async fn gather_data(&mut self) -> Result<State, TaskError> {
        self.say("Gathering data");
        let fallback = Fallback {
            next: State::GatherData,
            message: "Gathering data",
        };
        let resp = match self
            .request(HttpRequest::get("/"), fallback, Some(&*GATHER_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };

        if resp.is_redirect() {
            self.pause_error().await?;
            return Ok(State::GatherData);
        }
        match forms::access_token(&resp.body) {
            Some(token) => self.ck.access_token = Some(token),
            None if resp.is_success() && self.ck.access_token.is_some() => {}
            None => {
                tracing::warn!(status = resp.status, "no storefront token found");
                self.say("Invalid store");
                return Ok(State::Error);
            }
        }

        if self.config().account.is_some() {
            self.say("Logging in");
            return Ok(State::Login);
        }
        let ready = self.strategy().ready;
        self.say(ready_message(ready));
        Ok(ready)
    }

    pub(in crate::task) async fn login(&mut self) -> Result<State, TaskError> {
        let ready = self.strategy().ready;
        let Some(account) = self.config().account.clone() else {
            return Ok(ready);
        };
        self.say("Logging in");
        let req = HttpRequest::post("/account/login").form(forms::login_form(&account));
        let fallback = Fallback {
            next: State::Login,
            message: "Logging in",
        };
        match self.request(req, fallback, Some(&*LOGIN_REDIRECTS)).await? {
            Reply::Moved(next) => Ok(next),
            Reply::Proceed(_) => {
                self.say(ready_message(ready));
                Ok(ready)
            }
            Reply::Response(resp) => {
                if resp.body.to_ascii_lowercase().contains("incorrect email or password") {
                    self.say("Invalid credentials");
                    return Ok(State::Error);
                }
                self.pause_error().await?;
                Ok(State::Login)
            }
        }
    }

    pub(in crate::task) async fn wait_for_product(&mut self) -> Result<State, TaskError> {
        let Some(product) = self.ctx.product() else {
            self.say("Waiting for product");
            let delay = self.deps.settings.product_poll;
            self.pause(delay).await?;
            return Ok(State::WaitForProduct);
        };

        let config = self.config();
        let pick = pick_variant(&product.variants, &config.size, config.random_in_stock);
        let title = product.title.clone();
        self.ck.product = Some(product);
        match pick {
            Some(pick) => {
                tracing::info!(product = %title, size = %pick.size, variant = %pick.id, "variant picked");
                self.ck.pick = Some(pick);
                self.say(format!("Product found: {title}"));
                Ok(State::AddToCart)
            }
            None => {
                self.say("No size matched! Stopping...");
                Ok(State::Error)
            }
        }
    }

    pub(in crate::task) async fn go_to_checkpoint(&mut self) -> Result<State, TaskError> {
        self.say("Going to checkpoint");
        let fallback = Fallback {
            next: State::GoToCheckpoint,
            message: "Going to checkpoint",
        };
        let resp = match self
            .request(HttpRequest::get("/checkpoint"), fallback, Some(&*CHECKPOINT_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => return Ok(next),
            Reply::Proceed(resp) | Reply::Response(resp) => resp,
        };
        if !resp.is_success() {
            self.pause_error().await?;
            return Ok(State::GoToCheckpoint);
        }

        self.ck.checkpoint = forms::checkpoint_form(&resp.body);
        if let Some(key) = forms::sitekey(&resp.body) {
            self.ck.sitekey = Some(key);
        }
        if self.ctx.captcha_token.is_none() && forms::wants_captcha(&resp.body) {
            self.say("Waiting for captcha");
            return Ok(State::Captcha);
        }
        self.say("Submitting checkpoint");
        Ok(State::SubmitCheckpoint)
    }

    pub(in crate::task) async fn submit_checkpoint(&mut self) -> Result<State, TaskError> {
        let mut fields = self.ck.checkpoint.clone();
        if let Some(token) = self.ctx.captcha_token.take() {
            forms::upsert_after(
                &mut fields,
                "authenticity_token",
                "g-recaptcha-response",
                &token,
            );
        }
        self.say("Submitting checkpoint");
        let req = HttpRequest::post("/checkpoint").form(forms::encode(&fields));
        let fallback = Fallback {
            next: State::SubmitCheckpoint,
            message: "Submitting checkpoint",
        };
        match self
            .request(req, fallback, Some(&*SUBMIT_CHECKPOINT_REDIRECTS))
            .await?
        {
            Reply::Moved(next) => Ok(next),
            Reply::Proceed(_) | Reply::Response(_) => {
                self.pause_error().await?;
                Ok(State::GoToCheckpoint)
            }
        }
    }
}
