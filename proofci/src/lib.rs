//! proofci library crate.
//!
//! Durable job store, admission control, sandboxed execution and retry
//! policy for running formal-verification jobs on untrusted repositories.

pub mod config;
pub mod database;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
