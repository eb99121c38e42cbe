//! # Configuration Management
//!
//! Typed configuration for the keyplane secret core. Values are layered from
//! defaults, an optional `.env` file and `KEYPLANE__*` environment variables.
//! Nothing inside the core reads process state directly; callers load an
//! [`AppConfig`] once and pass the relevant sections down.

pub mod settings;

pub use settings::{AppConfig, DatabaseConfig, ObservabilityConfig, SecretsConfig, ENV_PREFIX};
