//! Background coordinator for a token treasury: keeps cached chain data
//! fresh, runs scheduled holder distributions and buy-and-burn cycles, and
//! logs every run to an append-only history.

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod cycle;
pub mod database;
pub mod error;
pub mod history;
pub mod retry;
pub mod run_lock;
pub mod scheduler;
pub mod services;
pub mod types;

#[cfg(test)]
mod testing;

pub use crate::coordinator::Coordinator;
pub use crate::error::{Error, Result};
