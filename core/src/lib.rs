//! Kina Core - shared types for the kina CRI shim.
//!
//! Holds the error taxonomy and configuration used by both the backend
//! adapter and the CRI service crates.

pub mod config;
pub mod error;

/// Shim version reported via the CRI Version RPC.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name reported via the CRI Version RPC.
pub const RUNTIME_NAME: &str = "kina";
