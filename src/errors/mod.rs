//! # Error Handling
//!
//! Error handling for the keyplane secret core. All fallible operations return
//! [`Result`], whose error side is the [`KeyplaneError`] taxonomy.

pub mod types;

pub use types::{KeyplaneError, Result};

/// Short alias used by service-layer signatures
pub type Error = KeyplaneError;
