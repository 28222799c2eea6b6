//! Wait policies.
//!
//! ## Contents
//! - [`BackoffPolicy`] how long SWAP waits after consecutive proxy swaps
//! - [`JitterPolicy`]  randomization so tasks and monitors do not poll in lock-step
//!
//! ## Quick wiring
//! ```text
//! ManagerConfig { swap_backoff: BackoffPolicy, monitor_jitter: JitterPolicy }
//!      ├─► CheckoutTask / RateFetcher SWAP: swap_backoff.next(consecutive_swaps)
//!      └─► Monitor poll loop:            monitor_jitter.apply(delays.monitor)
//! ```

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
