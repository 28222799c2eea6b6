//! # Transition tables.
//!
//! Each state that inspects a redirect target or a page body does it through
//! one of the tables below: an ordered list of case-insensitive patterns,
//! first match wins. Tables are data, so every transition can be audited and
//! tested without I/O.
//!
//! ```text
//! Rule { pattern, next, message, pause }
//!   next:  To(state) | Stay | ByMode { frontend, api } | Proceed
//!   pause: None | Monitor | Stock | Millis(n)
//! ```
//!
//! `Proceed` marks a success pattern: the handler continues with the response
//! instead of moving.

use std::sync::LazyLock;
use std::time::Duration;

use regex::{Regex, RegexBuilder};

use super::state::State;
use crate::model::Mode;

/// Where a matched rule sends the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    To(State),
    Stay,
    ByMode { frontend: State, api: State },
    Proceed,
}

impl Next {
    /// Resolves to a state; `None` for [`Next::Proceed`].
    pub fn resolve(self, current: State, mode: Mode) -> Option<State> {
        match self {
            Next::To(state) => Some(state),
            Next::Stay => Some(current),
            Next::ByMode { frontend, api } => Some(match mode {
                Mode::Frontend => frontend,
                Mode::Api => api,
            }),
            Next::Proceed => None,
        }
    }
}

/// Wait applied after a rule matched, before the next step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pause {
    None,
    /// The task's monitor delay.
    Monitor,
    /// The configured stock poll interval.
    Stock,
    Millis(u64),
}

impl Pause {
    pub fn duration(self, monitor: Duration, stock: Duration) -> Option<Duration> {
        match self {
            Pause::None => None,
            Pause::Monitor => Some(monitor),
            Pause::Stock => Some(stock),
            Pause::Millis(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub pattern: &'static str,
    pub next: Next,
    /// Status text; empty keeps the previous one.
    pub message: &'static str,
    pub pause: Pause,
}

const fn rule(pattern: &'static str, next: Next, message: &'static str) -> Rule {
    Rule {
        pattern,
        next,
        message,
        pause: Pause::None,
    }
}

const fn paused(pattern: &'static str, next: Next, message: &'static str, pause: Pause) -> Rule {
    Rule {
        pattern,
        next,
        message,
        pause,
    }
}

/// Compiled, ordered rule list.
pub struct Table {
    pub name: &'static str,
    rules: Vec<(Regex, Rule)>,
}

impl Table {
    fn compile(name: &'static str, rules: &[Rule]) -> Self {
        let rules = rules
            .iter()
            .filter_map(|r| {
                match RegexBuilder::new(r.pattern).case_insensitive(true).build() {
                    Ok(re) => Some((re, *r)),
                    Err(e) => {
                        tracing::error!(table = name, pattern = r.pattern, error = %e, "bad rule skipped");
                        None
                    }
                }
            })
            .collect();
        Self { name, rules }
    }

    /// First rule whose pattern occurs in `text`.
    pub fn find(&self, text: &str) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, rule)| rule)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

macro_rules! table {
    ($name:ident, [$($rule:expr),* $(,)?]) => {
        pub static $name: LazyLock<Table> =
            LazyLock::new(|| Table::compile(stringify!($name), &[$($rule),*]));
    };
}

use Next::{ByMode, Proceed, Stay, To};

const CHECKPOINT: Rule = rule("checkpoint", To(State::GoToCheckpoint), "Going to checkpoint");
const THROTTLE: Rule = rule("throttle", To(State::Queue), "Polling queue");
const PASSWORD: Rule = rule("password", Stay, "");

// -- redirect tables, matched against the Location header --

table!(GATHER_REDIRECTS, [PASSWORD]);

table!(LOGIN_REDIRECTS, [
    CHECKPOINT,
    rule("password", To(State::Login), "Logging in"),
    rule("challenge", To(State::Error), "Captcha needed"),
    rule("login", To(State::Error), "Invalid credentials"),
    rule("account", Proceed, "Logged in"),
]);

table!(CHECKPOINT_REDIRECTS, [
    rule("checkpoint", Stay, "Going to checkpoint"),
    rule("password", To(State::CreateCheckout), "Creating checkout"),
    THROTTLE,
    rule("checkouts", To(State::GoToCheckout), "Going to checkout"),
]);

table!(SUBMIT_CHECKPOINT_REDIRECTS, [
    rule("checkpoint", To(State::GoToCheckpoint), "Going to checkpoint"),
    THROTTLE,
    rule("checkouts", To(State::GoToCheckout), "Going to checkout"),
    rule("password", To(State::CreateCheckout), "Creating checkout"),
    rule("cart", To(State::CreateCheckout), "Creating checkout"),
    rule(r"/checkout(\?|$)", To(State::CreateCheckout), "Creating checkout"),
]);

table!(CREATE_CHECKOUT_REDIRECTS, [
    CHECKPOINT,
    rule("login", To(State::Error), "Account needed"),
    rule("password", Stay, "Creating checkout"),
    THROTTLE,
    rule(
        "checkouts",
        ByMode { frontend: State::GoToCheckout, api: State::SubmitCustomer },
        "Checkout created",
    ),
    rule("cart", To(State::AddToCart), "Adding to cart"),
]);

table!(ADD_TO_CART_REDIRECTS, [
    CHECKPOINT,
    rule("password", Stay, "Adding to cart"),
    THROTTLE,
]);

table!(CART_REDIRECTS, [CHECKPOINT, rule("password", Stay, "Going to cart"), THROTTLE]);

table!(CHECKOUT_REDIRECTS, [
    rule("login", To(State::Error), "Account needed"),
    CHECKPOINT,
    rule("password", Stay, "Going to checkout"),
    THROTTLE,
    rule("cart", To(State::SubmitCustomer), "Submitting information"),
]);

table!(SUBMIT_CUSTOMER_REDIRECTS, [
    rule("password", Stay, "Submitting information"),
    THROTTLE,
    rule("step=shipping_method", Proceed, "Fetching rates"),
    rule("step=payment_method", To(State::GoToPayment), "Going to payment"),
]);

table!(SHIPPING_REDIRECTS, [CHECKPOINT, rule("password", Stay, "Fetching rates"), THROTTLE]);

table!(SUBMIT_SHIPPING_REDIRECTS, [
    rule("processing", To(State::ProcessPayment), "Processing payment"),
    THROTTLE,
    rule("password", Stay, "Submitting shipping"),
    rule(
        "step=payment_method",
        ByMode { frontend: State::GoToPayment, api: State::PaymentToken },
        "Going to payment",
    ),
    rule("step=shipping_method", To(State::GoToShipping), "Fetching rates"),
    rule("step=contact_information", To(State::GoToCheckout), "Going to checkout"),
]);

table!(PAYMENT_REDIRECTS, [
    CHECKPOINT,
    rule("password", Stay, "Going to payment"),
    THROTTLE,
    rule("stock_problems", Stay, ""),
]);

table!(SUBMIT_PAYMENT_REDIRECTS, [
    rule("processing", To(State::ProcessPayment), "Processing payment"),
    CHECKPOINT,
    rule("password", Stay, "Submitting payment"),
    THROTTLE,
    rule("stock_problems", To(State::CompletePayment), "Submitting payment"),
]);

table!(COMPLETE_PAYMENT_REDIRECTS, [
    rule("processing", To(State::ProcessPayment), "Processing payment"),
    rule("stock_problems", To(State::GoToPayment), ""),
    CHECKPOINT,
    rule("password", To(State::GoToPayment), "Going to payment"),
    THROTTLE,
]);

// -- body tables, matched against the page --

table!(CHECKOUT_BODY, [
    rule("Getting available shipping rates", To(State::GoToShipping), "Fetching rates"),
    rule("stock_problems", To(State::SubmitCustomer), "Submitting information"),
]);

table!(SHIPPING_BODY, [
    rule("no shipping methods available", To(State::Error), "Unsupported country"),
    paused("Getting available shipping rates", Stay, "Fetching rates", Pause::Millis(150)),
]);

table!(SUBMIT_SHIPPING_BODY, [
    paused("Getting available shipping rates", Stay, "Fetching rates", Pause::Stock),
    rule("stock_problems", To(State::GoToPayment), "Going to payment"),
]);

table!(PAYMENT_BODY, [
    paused(
        "payments aren.t available right now|payments are not available",
        Stay,
        "Payments unavailable",
        Pause::Millis(250),
    ),
    paused("calculating taxes", Stay, "Calculating taxes", Pause::Stock),
    rule("/processing", To(State::ProcessPayment), "Processing payment"),
    paused("stock_problems", Stay, "Out of stock", Pause::Monitor),
]);

table!(SUBMIT_PAYMENT_BODY, [
    rule("Your payment can.t be processed", To(State::GoToPayment), "Checkout failed"),
    rule("stock_problems", To(State::GoToPayment), "Out of stock"),
    paused("calculating taxes", Stay, "Calculating taxes", Pause::Stock),
]);

// -- checkout step tables, matched against `Shopify.Checkout.step` --

table!(CHECKOUT_STEPS, [
    rule("processing", To(State::ProcessPayment), "Processing payment"),
    rule("review", To(State::CompletePayment), "Completing payment"),
    rule("contact", To(State::SubmitCustomer), "Submitting information"),
    rule("shipping", To(State::SubmitShipping), "Submitting shipping"),
    rule("payment", To(State::SubmitPayment), "Submitting payment"),
]);

table!(SUBMIT_PAYMENT_STEPS, [
    rule("processing", To(State::ProcessPayment), "Processing payment"),
    rule("contact_information", To(State::GoToCheckout), "Going to checkout"),
    rule("shipping_method", To(State::GoToShipping), "Fetching rates"),
    rule("payment_method", To(State::GoToPayment), "Going to payment"),
    rule("review", To(State::CompletePayment), "Completing payment"),
]);

table!(COMPLETE_PAYMENT_STEPS, [
    rule("processing", To(State::ProcessPayment), "Processing payment"),
    rule("password|review", Stay, "Completing payment"),
    rule("contact_information", To(State::SubmitCustomer), "Submitting information"),
    rule("shipping_method", To(State::SubmitShipping), "Submitting shipping"),
    rule("stock_problems", To(State::GoToPayment), "Out of stock"),
    rule("payment_method", To(State::SubmitPayment), "Submitting payment"),
]);

/// Every table, for auditing.
pub fn all() -> [&'static Table; 22] {
    [
        &*GATHER_REDIRECTS,
        &*LOGIN_REDIRECTS,
        &*CHECKPOINT_REDIRECTS,
        &*SUBMIT_CHECKPOINT_REDIRECTS,
        &*CREATE_CHECKOUT_REDIRECTS,
        &*ADD_TO_CART_REDIRECTS,
        &*CART_REDIRECTS,
        &*CHECKOUT_REDIRECTS,
        &*SUBMIT_CUSTOMER_REDIRECTS,
        &*SHIPPING_REDIRECTS,
        &*SUBMIT_SHIPPING_REDIRECTS,
        &*PAYMENT_REDIRECTS,
        &*SUBMIT_PAYMENT_REDIRECTS,
        &*COMPLETE_PAYMENT_REDIRECTS,
        &*CHECKOUT_BODY,
        &*SHIPPING_BODY,
        &*SUBMIT_SHIPPING_BODY,
        &*PAYMENT_BODY,
        &*SUBMIT_PAYMENT_BODY,
        &*CHECKOUT_STEPS,
        &*SUBMIT_PAYMENT_STEPS,
        &*COMPLETE_PAYMENT_STEPS,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next(table: &Table, text: &str, current: State, mode: Mode) -> Option<State> {
        table.find(text).and_then(|r| r.next.resolve(current, mode))
    }

    #[test]
    fn test_every_pattern_compiles() {
        let expected = [1, 5, 4, 6, 6, 3, 3, 5, 4, 3, 6, 4, 5, 5, 2, 2, 2, 4, 3, 5, 5, 6];
        for (table, n) in all().into_iter().zip(expected) {
            assert_eq!(table.len(), n, "{}", table.name);
        }
    }

    #[test]
    fn test_first_match_wins() {
        // "checkpoint" would also match "checkout"-like rules further down
        let s = next(
            &SUBMIT_CHECKPOINT_REDIRECTS,
            "https://shop.example.com/checkpoint?return_to=/checkout",
            State::SubmitCheckpoint,
            Mode::Frontend,
        );
        assert_eq!(s, Some(State::GoToCheckpoint));

        let s = next(
            &SUBMIT_CHECKPOINT_REDIRECTS,
            "https://shop.example.com/checkout",
            State::SubmitCheckpoint,
            Mode::Frontend,
        );
        assert_eq!(s, Some(State::CreateCheckout));
    }

    #[test]
    fn test_mode_dependent_targets() {
        let url = "https://shop.example.com/1/checkouts/abc";
        assert_eq!(
            next(&CREATE_CHECKOUT_REDIRECTS, url, State::CreateCheckout, Mode::Frontend),
            Some(State::GoToCheckout)
        );
        assert_eq!(
            next(&CREATE_CHECKOUT_REDIRECTS, url, State::CreateCheckout, Mode::Api),
            Some(State::SubmitCustomer)
        );
    }

    #[test]
    fn test_case_insensitive_and_stay() {
        assert_eq!(
            next(&ADD_TO_CART_REDIRECTS, "/PASSWORD", State::AddToCart, Mode::Frontend),
            Some(State::AddToCart)
        );
        let rule = SHIPPING_BODY.find("Getting available shipping rates...").unwrap();
        assert_eq!(rule.pause, Pause::Millis(150));
        assert_eq!(
            rule.pause.duration(Duration::from_secs(1), Duration::from_millis(500)),
            Some(Duration::from_millis(150))
        );
    }

    #[test]
    fn test_proceed_does_not_resolve() {
        let rule = LOGIN_REDIRECTS.find("https://shop.example.com/account").unwrap();
        assert_eq!(rule.next, Proceed);
        assert_eq!(rule.next.resolve(State::Login, Mode::Frontend), None);
        assert_eq!(
            next(&LOGIN_REDIRECTS, "/account/login", State::Login, Mode::Frontend),
            Some(State::Error)
        );
    }

    #[test]
    fn test_step_tables() {
        assert_eq!(
            next(&CHECKOUT_STEPS, "contact_information", State::GoToCheckout, Mode::Frontend),
            Some(State::SubmitCustomer)
        );
        assert_eq!(
            next(&COMPLETE_PAYMENT_STEPS, "review", State::CompletePayment, Mode::Frontend),
            Some(State::CompletePayment)
        );
        assert!(CHECKOUT_STEPS.find("thank_you").is_none());
    }
}
