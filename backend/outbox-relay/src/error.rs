//! Service-level error taxonomy.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced outside a batch cycle. Nothing inside a cycle escapes:
/// publish failures are settled into rows and batch errors land in the
/// batch result.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration failed validation; the process refuses to start.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// The outbox store is unreachable or rejected a statement.
    #[error("storage error: {0}")]
    Storage(#[from] outbox_store::OutboxStoreError),

    /// The broker publisher failed outside the settle path.
    #[error("broker error: {0}")]
    Broker(#[from] amqp_publisher::PublishError),

    /// Unrecoverable initialisation failure; the supervisor enters `Error`.
    #[error("startup failed: {0}")]
    Startup(String),
}
