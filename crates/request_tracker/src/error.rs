//! Error types at the edges of the tracker.
//!
//! Span and request operations never fail; these cover configuration loading
//! and process-wide registry installation only.

use thiserror::Error;

/// Errors raised while loading a [`RegistryConfig`](crate::RegistryConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration document could not be parsed.
    #[error("invalid registry configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised by [`install`](crate::install).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InstallError {
    /// A process-wide registry has already been installed.
    #[error("a global request registry is already installed")]
    AlreadyInstalled,
}
