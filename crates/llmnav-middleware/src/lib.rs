//! `llmnav-middleware` – in-process event routing.
//!
//! Decouples the control loop from logging and session recording.
//!
//! # Modules
//!
//! - [`bus`] – Synchronous publish/subscribe event bus with per-handler
//!   failure isolation.

pub mod bus;

pub use bus::{EventBus, Handler, NotifyOutcome, SubscriptionId};
