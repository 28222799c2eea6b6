//! CAPTCHA and SWAP: the two detours that resume where they were entered.

use crate::error::TaskError;
use crate::services::{CaptchaStatus, HarvestRequest};
use crate::task::engine::CheckoutTask;
use crate::task::state::State;

/// State a solved captcha resumes at, given the state that asked for it.
pub(crate) fn captcha_resume(origin: State) -> State {
    match origin {
        State::GoToShipping => State::SubmitShipping,
        State::GoToCheckpoint => State::SubmitCheckpoint,
        State::GoToCheckout | State::SubmitShipping => State::SubmitCustomer,
        State::SubmitPayment => State::CompletePayment,
        other => other,
    }
}

impl CheckoutTask {
    pub(in crate::task) async fn captcha(&mut self) -> Result<State, TaskError> {
        let origin = self.origins.captcha.unwrap_or(self.prev);
        let config = self.config();
        let request = match self.ctx.captcha.clone() {
            Some(request) => request,
            None => {
                let harvest = HarvestRequest {
                    task_id: self.ctx.id.to_string(),
                    store_url: config.store.base().to_string(),
                    sitekey: self.ck.sitekey.clone(),
                    platform: config.platform,
                    priority: matches!(origin, State::GoToCheckpoint | State::SubmitCheckpoint),
                };
                let request = self.deps.captcha.get_captcha(harvest).await;
                self.ctx.captcha = Some(request.clone());
                request
            }
        };

        match request.status() {
            CaptchaStatus::Pending => {
                self.say("Waiting for captcha");
                let delay = self.deps.settings.captcha_poll;
                // a solved request cuts the poll short
                tokio::select! {
                    _ = request.settled() => {}
                    paused = self.pause(delay) => paused?,
                }
                Ok(State::Captcha)
            }
            CaptchaStatus::Fulfilled(token) => {
                self.ctx.captcha = None;
                self.ctx.captcha_token = Some(token);
                self.deps
                    .captcha
                    .suspend_harvest(&self.ctx.id, config.platform)
                    .await;
                let next = captcha_resume(origin);
                tracing::debug!(origin = %origin, next = %next, "captcha solved");
                self.say("Captcha solved");
                Ok(next)
            }
            CaptchaStatus::Cancelled | CaptchaStatus::Destroyed => {
                self.ctx.captcha = None;
                self.say("Captcha failed");
                Ok(State::Error)
            }
        }
    }

    /// Leases a fresh proxy, moves the session onto it and backs off.
    pub(in crate::task) async fn swap(&mut self) -> Result<State, TaskError> {
        let config = self.config();
        let attempt = self.ck.swaps;
        self.ck.swaps = attempt.saturating_add(1);
        let delay = self.deps.settings.swap_backoff.next(attempt);

        let next = self
            .deps
            .proxies
            .swap(&self.ctx.id, config.store.base(), config.platform, self.ctx.proxy.as_ref())
            .await;
        self.session.use_proxy(next.as_ref())?;
        tracing::info!(proxy = next.as_ref().map_or("direct", |p| p.label()), "proxy swapped");
        self.ctx.proxy = next;

        self.say(format!("Proxy swapped! Delaying {}ms", delay.as_millis()));
        self.pause(delay).await?;
        Ok(self.origins.swap.unwrap_or(self.prev))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_captcha_resume_targets() {
        assert_eq!(captcha_resume(State::GoToShipping), State::SubmitShipping);
        assert_eq!(captcha_resume(State::GoToCheckpoint), State::SubmitCheckpoint);
        assert_eq!(captcha_resume(State::GoToCheckout), State::SubmitCustomer);
        assert_eq!(captcha_resume(State::SubmitShipping), State::SubmitCustomer);
        assert_eq!(captcha_resume(State::SubmitPayment), State::CompletePayment);
        assert_eq!(captcha_resume(State::SubmitCustomer), State::SubmitCustomer);
        assert_eq!(captcha_resume(State::CompletePayment), State::CompletePayment);
    }
}
