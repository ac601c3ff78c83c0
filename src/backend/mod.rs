//! Backend integration module for the tracking platform.
//!
//! This module provides the HTTP client and the traits through which the sync layer reaches
//! the backend. The backend is treated as a black box: JSON resources are fetched by URL, and
//! topic routing and device commands go through short request/response calls.

/// HTTP client for resource fetches and control calls
mod client;
/// Error types, request bodies and injection traits
mod types;

pub use client::{HttpBackend, parse_api_base, resolve_locator};
pub use types::*;
