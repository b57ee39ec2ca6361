//! Shared types for the Lumber search gateway.

pub mod error;

pub use error::{Error, Result};
