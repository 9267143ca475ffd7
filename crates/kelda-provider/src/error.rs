//! Error types for the provider adapters.

use thiserror::Error;

/// Result type alias for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors surfaced by a provider adapter.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The blueprint requested a configuration this provider cannot
    /// satisfy (for example preemptible VMs on the local provider).
    /// Not retried until the blueprint changes.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    /// A provider API call failed. Retried on the next reconciler pass.
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}
