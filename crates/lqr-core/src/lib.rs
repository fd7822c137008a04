//! Core of the question relay: quota ledger, question store, reply resolution
//! and the orchestrator that ties them together.
//!
//! Transport-agnostic. The Telegram adapter lives in `lqr-telegram` and talks
//! to this crate through [`relay::Relay`] and the [`messaging::port::MessagingPort`] trait.

pub mod config;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod relay;
pub mod resolver;
pub mod security;
pub mod storage;

pub use errors::{Error, Result};
