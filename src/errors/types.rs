//! # Error Types
//!
//! Error taxonomy for the keyplane secret core using `thiserror`.
//!
//! The four kinds a caller must distinguish are `NotFound`, `BadRequest`,
//! `Forbidden` and `Database`. The remaining variants cover ambient failures
//! (configuration, serialization, encryption) that are not part of the
//! secret semantics themselves.

/// Custom result type for keyplane operations
pub type Result<T> = std::result::Result<T, KeyplaneError>;

/// Main error type for the keyplane secret core
#[derive(thiserror::Error, Debug)]
pub enum KeyplaneError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Database and storage errors
    #[error("Database error: {context}")]
    Database {
        #[source]
        source: sqlx::Error,
        context: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {context}")]
    Serialization {
        #[source]
        source: serde_json::Error,
        context: String,
    },

    /// Invalid input: duplicate keys, empty names, unknown tags, ...
    #[error("Bad request: {message}")]
    BadRequest {
        message: String,
        field: Option<String>,
    },

    /// Permission denied, including denial of a referenced secret during expansion
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Resource not found errors
    #[error("Resource not found: {resource_type} '{id}'")]
    NotFound {
        resource_type: String,
        id: String,
    },

    /// Encrypt/decrypt capability failures
    #[error("Encryption error: {message}")]
    Encryption { message: String },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl KeyplaneError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), source: None }
    }

    /// Create a configuration error with source
    pub fn config_with_source<S: Into<String>>(
        message: S,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        Self::Config { message: message.into(), source: Some(source) }
    }

    /// Wrap a storage driver error with the operation that failed
    pub fn database<S: Into<String>>(source: sqlx::Error, context: S) -> Self {
        Self::Database { source, context: context.into() }
    }

    /// Create a bad request error
    pub fn bad_request<S: Into<String>>(message: S) -> Self {
        Self::BadRequest { message: message.into(), field: None }
    }

    /// Create a bad request error with field information
    pub fn bad_request_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::BadRequest { message: message.into(), field: Some(field.into()) }
    }

    /// Create a forbidden error
    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::Forbidden { message: message.into() }
    }

    /// Create a not found error
    pub fn not_found<R: Into<String>, I: Into<String>>(resource_type: R, id: I) -> Self {
        Self::NotFound { resource_type: resource_type.into(), id: id.into() }
    }

    /// Create an encryption error
    pub fn encryption<S: Into<String>>(message: S) -> Self {
        Self::Encryption { message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Prefix the context of storage-level errors
    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        let context = context.into();
        match &mut self {
            KeyplaneError::Database { context: ref mut ctx, .. }
            | KeyplaneError::Serialization { context: ref mut ctx, .. } => {
                *ctx = format!("{}: {}", context, ctx);
            }
            _ => {}
        }
        self
    }

    /// Get the HTTP status code the transport layer should return for this error
    pub fn status_code(&self) -> u16 {
        match self {
            KeyplaneError::Config { .. } => 500,
            KeyplaneError::Database { .. } => 500,
            KeyplaneError::Serialization { .. } => 400,
            KeyplaneError::BadRequest { .. } => 400,
            KeyplaneError::Forbidden { .. } => 403,
            KeyplaneError::NotFound { .. } => 404,
            KeyplaneError::Encryption { .. } => 500,
            KeyplaneError::Internal { .. } => 500,
        }
    }

    /// Whether this error is a unique-constraint violation reported by the store
    pub fn is_unique_violation(&self) -> bool {
        match self {
            KeyplaneError::Database { source: sqlx::Error::Database(db_err), .. } => {
                db_err.is_unique_violation()
            }
            _ => false,
        }
    }
}

// Error conversions for common external error types
impl From<sqlx::Error> for KeyplaneError {
    fn from(error: sqlx::Error) -> Self {
        Self::Database { source: error, context: "Database operation failed".to_string() }
    }
}

impl From<serde_json::Error> for KeyplaneError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization { source: error, context: "JSON serialization failed".to_string() }
    }
}

impl From<config::ConfigError> for KeyplaneError {
    fn from(error: config::ConfigError) -> Self {
        Self::config_with_source("Configuration loading failed", Box::new(error))
    }
}

impl From<validator::ValidationErrors> for KeyplaneError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let message = errors
            .field_errors()
            .iter()
            .map(|(field, field_errors)| {
                let error_messages: Vec<String> = field_errors
                    .iter()
                    .map(|e| {
                        e.message.as_ref().map_or("Invalid value".to_string(), |m| m.to_string())
                    })
                    .collect();
                format!("{}: {}", field, error_messages.join(", "))
            })
            .collect::<Vec<_>>()
            .join("; ");

        Self::config(format!("Validation failed: {}", message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = KeyplaneError::config("Test configuration error");
        assert!(matches!(error, KeyplaneError::Config { .. }));
        assert_eq!(error.to_string(), "Configuration error: Test configuration error");
    }

    #[test]
    fn test_bad_request_field() {
        let error = KeyplaneError::bad_request_field("Secret already exists", "DB_URL");
        if let KeyplaneError::BadRequest { field, .. } = error {
            assert_eq!(field, Some("DB_URL".to_string()));
        } else {
            panic!("expected bad request");
        }
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(KeyplaneError::bad_request("test").status_code(), 400);
        assert_eq!(KeyplaneError::forbidden("test").status_code(), 403);
        assert_eq!(KeyplaneError::not_found("Folder", "/a").status_code(), 404);
        assert_eq!(KeyplaneError::encryption("test").status_code(), 500);
        assert_eq!(KeyplaneError::internal("test").status_code(), 500);
    }

    #[test]
    fn test_not_found_display() {
        let error = KeyplaneError::not_found("Folder", "/app/api");
        assert_eq!(error.to_string(), "Resource not found: Folder '/app/api'");
    }

    #[test]
    fn test_with_context_prefixes_storage_errors() {
        let error = KeyplaneError::database(sqlx::Error::RowNotFound, "Failed to load secret")
            .with_context("bulk update");
        match error {
            KeyplaneError::Database { context, .. } => {
                assert_eq!(context, "bulk update: Failed to load secret")
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let untouched = KeyplaneError::forbidden("nope").with_context("ignored");
        assert_eq!(untouched.to_string(), "Forbidden: nope");
    }

    #[test]
    fn test_error_conversions() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: KeyplaneError = json_error.into();
        assert!(matches!(error, KeyplaneError::Serialization { .. }));

        let error: KeyplaneError = sqlx::Error::RowNotFound.into();
        assert!(matches!(error, KeyplaneError::Database { .. }));
        assert!(!error.is_unique_violation());
    }
}
