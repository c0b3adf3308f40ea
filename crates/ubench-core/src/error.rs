//! Error types for recipe loading and configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for recipe operations.
pub type RecipeResult<T> = Result<T, RecipeError>;

/// Errors raised while loading or validating a recipe.
///
/// Every variant is a validation failure from the operator's point of view:
/// nothing is retried and nothing is submitted.
#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("recipe not found: {kind} recipe '{name}' (looked in {path})")]
    NotFound {
        kind: String,
        name: String,
        path: PathBuf,
    },

    #[error("failed to read recipe {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse recipe {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid recipe '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("recipe '{name}' is a {found} recipe, expected {expected}")]
    WrongKind {
        name: String,
        expected: String,
        found: String,
    },

    #[error("recipe already exists: {0}")]
    AlreadyExists(PathBuf),
}

impl RecipeError {
    pub(crate) fn invalid(name: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while loading `ubench.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid config value for {key}: {value}")]
    Invalid { key: String, value: String },
}
