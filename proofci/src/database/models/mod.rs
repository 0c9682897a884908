//! Database models.
//!
//! These map directly to the schema; JSON columns stay as strings here and
//! are decoded when converting into domain types.

pub mod job;

pub use job::*;
