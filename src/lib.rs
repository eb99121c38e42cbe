//! # Keyplane
//!
//! Secret storage and reference-resolution core for a multi-tenant secrets
//! manager. Projects hold environments, environments hold a folder tree, and
//! folders hold encrypted, versioned secrets whose values may reference one
//! another with `${KEY}` or `${env.path.KEY}` tokens.
//!
//! ## Architecture
//!
//! ```text
//! SecretService / MoveOrchestrator → SecretStore → Repositories → SQLite
//!        ↓                                ↓
//! SecretExpander                  Collaborators (approval, reminders, sync)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use keyplane::{AppConfig, Keyplane, Result};
//! use keyplane::services::Collaborators;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = AppConfig::load()?;
//!     let keyplane = Keyplane::connect(config, Collaborators::default()).await?;
//!     let _service = keyplane.secret_service();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod services;
pub mod storage;

use std::sync::Arc;

// Re-export commonly used types and traits
pub use config::AppConfig;
pub use errors::{KeyplaneError, Result};
pub use observability::init_observability;

use services::{AesGcmCipher, Collaborators, MoveOrchestrator, SecretCipher, SecretService};
use storage::{create_pool, DbPool, EnvironmentRepository, FolderRepository, TagRepository};

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

/// Wired-up secret core: pool, cipher and services
#[derive(Debug, Clone)]
pub struct Keyplane {
    config: AppConfig,
    pool: DbPool,
    secrets: SecretService,
}

impl Keyplane {
    /// Open the database, run migrations if configured and build the services
    pub async fn connect(config: AppConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let cipher: Arc<dyn SecretCipher> = Arc::new(AesGcmCipher::new(&config.secrets)?);
        Self::with_cipher(config, cipher, collaborators).await
    }

    /// Like [`Self::connect`] with a caller-supplied cipher
    pub async fn with_cipher(
        config: AppConfig,
        cipher: Arc<dyn SecretCipher>,
        collaborators: Collaborators,
    ) -> Result<Self> {
        tracing::info!(app_name = APP_NAME, version = VERSION, "Starting keyplane secret core");

        let pool = create_pool(&config.database).await?;
        let secrets = SecretService::new(pool.clone(), cipher, collaborators, &config.secrets);

        Ok(Self { config, pool, secrets })
    }

    pub fn secret_service(&self) -> &SecretService {
        &self.secrets
    }

    pub fn move_orchestrator(&self) -> MoveOrchestrator {
        MoveOrchestrator::new(self.secrets.clone())
    }

    pub fn environments(&self) -> EnvironmentRepository {
        EnvironmentRepository::new(self.pool.clone())
    }

    pub fn folders(&self) -> FolderRepository {
        FolderRepository::new(self.pool.clone())
    }

    pub fn tags(&self) -> TagRepository {
        TagRepository::new(self.pool.clone())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "keyplane");
    }
}
