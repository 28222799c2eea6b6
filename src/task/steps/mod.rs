//! State handlers, grouped by funnel stage.
//!
//! Each handler is an `async fn(&mut CheckoutTask) -> Result<State, TaskError>`
//! and returns exactly one successor state.

mod cart;
mod checkout;
mod payment;
mod recovery;
mod setup;
