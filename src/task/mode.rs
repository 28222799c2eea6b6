//! Per-mode strategy table.
//!
//! Both modes walk the same states; a [`Strategy`] holds the handful of
//! places where they differ: which endpoint a step talks to, what it sends,
//! and where the funnel goes next.
//!
//! ```text
//!                    Frontend               Api
//! ready              WAIT_FOR_PRODUCT       CREATE_CHECKOUT
//! after cart add     GO_TO_CART             GO_TO_CHECKOUT
//! after rate found   SUBMIT_SHIPPING        PAYMENT_TOKEN
//! payment rewind     GO_TO_PAYMENT          PAYMENT_TOKEN
//! create checkout    POST /cart (form)      POST /checkout (json)
//! add to cart        POST /cart/add.js form POST /cart/add.js json
//! customer / pay     POST form to checkout  PATCH json to wallets / checkout
//! ```

use serde_json::{Value, json};

use super::forms::{self, Fields};
use super::state::State;
use crate::http::HttpRequest;
use crate::model::{Mode, Profile};

pub(crate) const TOKEN_HEADER: &str = "X-Shopify-Storefront-Access-Token";

/// Checkout a request is aimed at.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    /// `/{store id}/checkouts/{hash}`.
    pub url: &'a str,
    pub hash: &'a str,
    /// Storefront access token.
    pub token: Option<&'a str>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Strategy {
    pub mode: Mode,
    /// State after GATHER_DATA / LOGIN.
    pub ready: State,
    pub after_cart: State,
    pub after_rate: State,
    /// State a declined payment goes back to.
    pub payment_rewind: State,
}

pub static FRONTEND: Strategy = Strategy {
    mode: Mode::Frontend,
    ready: State::WaitForProduct,
    after_cart: State::GoToCart,
    after_rate: State::SubmitShipping,
    payment_rewind: State::GoToPayment,
};

pub static API: Strategy = Strategy {
    mode: Mode::Api,
    ready: State::CreateCheckout,
    after_cart: State::GoToCheckout,
    after_rate: State::PaymentToken,
    payment_rewind: State::PaymentToken,
};

impl Strategy {
    pub fn of(mode: Mode) -> &'static Strategy {
        match mode {
            Mode::Frontend => &FRONTEND,
            Mode::Api => &API,
        }
    }

    fn is_api(&self) -> bool {
        self.mode == Mode::Api
    }

    fn with_token(&self, req: HttpRequest, token: Option<&str>) -> HttpRequest {
        match token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    pub fn create_checkout(&self, cart: &Fields) -> HttpRequest {
        if self.is_api() {
            return HttpRequest::post("/checkout").json(json!({}));
        }
        let mut fields = cart.clone();
        fields.push(("checkout".into(), "Check out".into()));
        HttpRequest::post("/cart").form(forms::encode(&fields))
    }

    pub fn add_to_cart(&self, variant: &str) -> HttpRequest {
        let req = HttpRequest::post("/cart/add.js");
        if self.is_api() {
            return req.json(json!({ "id": variant, "quantity": 1 }));
        }
        req.form(forms::encode(&[
            ("id".into(), variant.into()),
            ("quantity".into(), "1".into()),
        ]))
    }

    /// Customer information. `form` is the scraped, protected checkout form
    /// when the page demanded it be echoed back.
    pub fn submit_customer(
        &self,
        target: Target<'_>,
        setup: bool,
        profile: &Profile,
        form: Option<&Fields>,
        captcha: Option<&str>,
    ) -> HttpRequest {
        if self.is_api() && !setup {
            let req = HttpRequest::patch(format!("/wallets/checkouts/{}.json", target.hash))
                .json(forms::wallet_customer(profile, captcha));
            return self.with_token(req, target.token);
        }
        let body = match form {
            Some(fields) => {
                let mut fields = fields.clone();
                if let Some(captcha) = captcha {
                    forms::upsert_after(
                        &mut fields,
                        "authenticity_token",
                        "g-recaptcha-response",
                        captcha,
                    );
                }
                forms::encode(&fields)
            }
            None => forms::contact_form(profile, captcha),
        };
        HttpRequest::post(target.url).form(body)
    }

    pub fn submit_shipping(&self, url: &str, rate_id: &str, form: Option<&Fields>) -> HttpRequest {
        let body = match form {
            Some(fields) => {
                let mut fields = fields.clone();
                forms::upsert_after(&mut fields, "step", "checkout[shipping_rate][id]", rate_id);
                forms::encode(&fields)
            }
            None => forms::shipping_form(rate_id),
        };
        HttpRequest::post(url).form(body)
    }

    /// Payment with the vaulted card session.
    pub fn submit_payment(
        &self,
        target: Target<'_>,
        profile: &Profile,
        session: &str,
        gateway: &str,
        rate_id: Option<&str>,
        captcha: Option<&str>,
    ) -> HttpRequest {
        if self.is_api() {
            let req = HttpRequest::patch(target.url)
                .json(forms::wallet_payment(session, rate_id, captcha));
            return self.with_token(req, target.token);
        }
        HttpRequest::post(target.url).form(forms::payment_form(profile, session, gateway))
    }

    pub fn complete_payment(&self, target: Target<'_>, captcha: Option<&str>) -> HttpRequest {
        if self.is_api() {
            let mut body = json!({ "complete": 1 });
            if let (Some(captcha), Value::Object(map)) = (captcha, &mut body) {
                map.insert("g-recaptcha-response".into(), captcha.into());
            }
            return self.with_token(HttpRequest::patch(target.url).json(body), target.token);
        }
        HttpRequest::post(target.url).form(forms::complete_form(captcha))
    }

    /// Where a task resumes once it leaves the queue.
    ///
    /// `origin` is the state that sent the task into the queue.
    pub fn queue_resume(&self, origin: State, has_rate: bool, force_captcha: bool) -> State {
        let api = self.is_api();
        match origin {
            State::AddToCart if api => State::GoToCheckout,
            State::AddToCart => State::GoToCart,
            State::GoToCart => State::CreateCheckout,
            State::CreateCheckout if api => State::SubmitCustomer,
            State::CreateCheckout => State::GoToCheckout,
            State::GoToCheckout if api && has_rate && force_captcha => State::Captcha,
            State::GoToCheckout if api && has_rate => State::PaymentToken,
            State::GoToCheckout if api => State::SubmitCustomer,
            State::GoToCheckout => State::GoToCheckout,
            State::SubmitCustomer if api => State::WaitForProduct,
            State::SubmitCustomer => State::GoToShipping,
            State::SubmitShipping | State::SubmitPayment if api => State::SubmitPayment,
            State::SubmitShipping | State::SubmitPayment => State::GoToPayment,
            State::CompletePayment if api => State::CompletePayment,
            State::CompletePayment => State::GoToPayment,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Body;
    use crate::model::fixtures;

    #[test]
    fn test_funnel_differs_by_mode() {
        assert_eq!(Strategy::of(Mode::Frontend).ready, State::WaitForProduct);
        assert_eq!(Strategy::of(Mode::Api).ready, State::CreateCheckout);
        assert_eq!(FRONTEND.after_cart, State::GoToCart);
        assert_eq!(API.payment_rewind, State::PaymentToken);
    }

    #[test]
    fn test_queue_resume_table() {
        let cases = [
            (State::AddToCart, State::GoToCart, State::GoToCheckout),
            (State::GoToCart, State::CreateCheckout, State::CreateCheckout),
            (State::CreateCheckout, State::GoToCheckout, State::SubmitCustomer),
            (State::GoToCheckout, State::GoToCheckout, State::SubmitCustomer),
            (State::SubmitCustomer, State::GoToShipping, State::WaitForProduct),
            (State::SubmitShipping, State::GoToPayment, State::SubmitPayment),
            (State::SubmitPayment, State::GoToPayment, State::SubmitPayment),
            (State::CompletePayment, State::GoToPayment, State::CompletePayment),
            (State::GoToShipping, State::GoToShipping, State::GoToShipping),
        ];
        for (origin, frontend, api) in cases {
            assert_eq!(FRONTEND.queue_resume(origin, false, false), frontend, "{origin}");
            assert_eq!(API.queue_resume(origin, false, false), api, "{origin}");
        }
        assert_eq!(API.queue_resume(State::GoToCheckout, true, false), State::PaymentToken);
        assert_eq!(API.queue_resume(State::GoToCheckout, true, true), State::Captcha);
    }

    #[test]
    fn test_requests_by_mode() {
        let cart = vec![("updates[]".to_string(), "1".to_string())];
        let req = FRONTEND.create_checkout(&cart);
        assert_eq!(req.target, "/cart");
        assert_eq!(req.body, Body::Form("updates%5B%5D=1&checkout=Check+out".into()));
        assert_eq!(API.create_checkout(&cart).body, Body::Json(json!({})));

        let req = API.add_to_cart("42");
        assert_eq!(req.body, Body::Json(json!({ "id": "42", "quantity": 1 })));
        assert_eq!(
            FRONTEND.add_to_cart("42").body,
            Body::Form("id=42&quantity=1".into())
        );
    }

    #[test]
    fn test_api_customer_uses_wallet_until_setup() {
        let profile = fixtures::task("t").profile;
        let target = Target {
            url: "/1/checkouts/h",
            hash: "h",
            token: Some("tok"),
        };
        let req = API.submit_customer(target, false, &profile, None, None);
        assert_eq!(req.target, "/wallets/checkouts/h.json");
        assert_eq!(req.method, crate::http::Method::PATCH);
        assert_eq!(req.headers, vec![(TOKEN_HEADER, "tok".to_string())]);

        let req = API.submit_customer(target, true, &profile, None, Some("cap"));
        assert_eq!(req.target, "/1/checkouts/h");
        match req.body {
            Body::Form(body) => assert!(body.contains("g-recaptcha-response=cap")),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn test_protected_shipping_form_is_echoed() {
        let form = vec![
            ("_method".to_string(), "patch".to_string()),
            ("step".to_string(), "payment_method".to_string()),
        ];
        let req = FRONTEND.submit_shipping("/1/checkouts/h", "rate-1", Some(&form));
        assert_eq!(
            req.body,
            Body::Form("_method=patch&step=payment_method&checkout%5Bshipping_rate%5D%5Bid%5D=rate-1".into())
        );
    }
}
