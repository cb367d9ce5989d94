//! Error types for agent-foreman.
//!
//! Worker executions deliberately have no error enum of their own: every
//! observable worker outcome (spawn failure, timeout, signal, bad exit)
//! resolves into an `ExecutionOutcome` and is classified there, so error
//! handling downstream is uniform matching on a result rather than
//! exception unwinding.

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task registry errors — bad input or unknown task ids.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
