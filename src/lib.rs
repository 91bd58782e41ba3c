#![forbid(unsafe_code)]

//! `agent-warden`: local supervision ledger for ephemeral agent workers.

pub mod app;
pub mod audit;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use app::Warden;
pub use config::GlobalConfig;
pub use errors::{AppError, Result};
