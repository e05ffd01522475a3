//! Background digest scheduler.
//!
//! Sends each standup's digest once its daily start time has passed and
//! retries failed deliveries.

pub mod runner;

pub use runner::{DeliveryFn, DigestEvent, DigestScheduler, TickReport};
