//! Checkout states.

use std::fmt;

use serde::Serialize;

/// Closed set of checkout states.
///
/// `Error`, `Abort` and `Done` are terminal: the engine stops on them and
/// emits nothing further for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    GatherData,
    Login,
    WaitForProduct,
    AddToCart,
    GoToCart,
    CreateCheckout,
    GoToCheckpoint,
    SubmitCheckpoint,
    Queue,
    GoToCheckout,
    SubmitCustomer,
    GoToShipping,
    SubmitShipping,
    GoToPayment,
    PaymentToken,
    SubmitPayment,
    CompletePayment,
    ProcessPayment,
    Captcha,
    Swap,
    Error,
    Abort,
    Done,
}

impl State {
    pub const ALL: [State; 23] = [
        State::GatherData,
        State::Login,
        State::WaitForProduct,
        State::AddToCart,
        State::GoToCart,
        State::CreateCheckout,
        State::GoToCheckpoint,
        State::SubmitCheckpoint,
        State::Queue,
        State::GoToCheckout,
        State::SubmitCustomer,
        State::GoToShipping,
        State::SubmitShipping,
        State::GoToPayment,
        State::PaymentToken,
        State::SubmitPayment,
        State::CompletePayment,
        State::ProcessPayment,
        State::Captcha,
        State::Swap,
        State::Error,
        State::Abort,
        State::Done,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Error | State::Abort | State::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::GatherData => "GATHER_DATA",
            State::Login => "LOGIN",
            State::WaitForProduct => "WAIT_FOR_PRODUCT",
            State::AddToCart => "ADD_TO_CART",
            State::GoToCart => "GO_TO_CART",
            State::CreateCheckout => "CREATE_CHECKOUT",
            State::GoToCheckpoint => "GO_TO_CHECKPOINT",
            State::SubmitCheckpoint => "SUBMIT_CHECKPOINT",
            State::Queue => "QUEUE",
            State::GoToCheckout => "GO_TO_CHECKOUT",
            State::SubmitCustomer => "SUBMIT_CUSTOMER",
            State::GoToShipping => "GO_TO_SHIPPING",
            State::SubmitShipping => "SUBMIT_SHIPPING",
            State::GoToPayment => "GO_TO_PAYMENT",
            State::PaymentToken => "PAYMENT_TOKEN",
            State::SubmitPayment => "SUBMIT_PAYMENT",
            State::CompletePayment => "COMPLETE_PAYMENT",
            State::ProcessPayment => "PROCESS_PAYMENT",
            State::Captcha => "CAPTCHA",
            State::Swap => "SWAP",
            State::Error => "ERROR",
            State::Abort => "ABORT",
            State::Done => "DONE",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<State> = State::ALL.into_iter().filter(State::is_terminal).collect();
        assert_eq!(terminal, [State::Error, State::Abort, State::Done]);
    }

    #[test]
    fn test_names_match_serde() {
        for state in State::ALL {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, state.as_str());
        }
    }
}
