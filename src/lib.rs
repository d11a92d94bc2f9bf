//! Admission control and request lifecycle core for an LLM proxy gateway.
//!
//! Requests are admitted against per-user, per-product and global token and cost
//! budgets kept in fixed-window counters (Redis, with a process-local fallback),
//! forwarded to a provider, and reconciled with the usage the provider reports.

mod error;

pub mod gateway;

pub use error::{GatekeeperError, Result};
