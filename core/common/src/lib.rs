//! Common utilities and types shared across the memory vault crates.
//!
//! This module provides the error taxonomy and the small identifier and
//! sensitive-data types used by every other crate in the workspace.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{SensitiveBytes, VaultId};
