//! # Checkout tasks.
//!
//! - [`State`]        the closed set of funnel states
//! - [`CheckoutTask`] the state machine driving one purchase attempt
//! - [`RateFetcher`]  a reduced task that only caches a shipping rate
//! - [`table`]        redirect, body and step tables consulted by the handlers
//!
//! ```text
//! GATHER_DATA ─► [LOGIN] ─► WAIT_FOR_PRODUCT ─► ADD_TO_CART ─► ... ─► PROCESS_PAYMENT ─► DONE
//!                      any state ─► QUEUE | CAPTCHA | SWAP ─► back to where it came from
//! ```

mod engine;
mod forms;
mod mode;
mod rates;
mod state;
mod steps;
pub mod table;

pub use engine::{Checkout, CheckoutTask, TaskDeps, TaskSettings};
pub use rates::{Phase, RateFetcher};
pub use state::State;
