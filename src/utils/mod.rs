//!
//! Utility module for the sync layer.
//!
//! Re-exports lock, id and callback helpers used throughout the codebase.
/// Shared helpers for locking, identifiers and guarded callbacks
pub mod index;

pub use index::{invoke_guarded, lock, random_hex_id};
