//! Error taxonomy for the query-mediation layer.
//!
//! Every variant names the table, collection, or query it concerns so that
//! a caller (usually an agent on the other side of the tool surface) can
//! act on it. None of these errors terminate the serving process.

use thiserror::Error;

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Query text rejected by the [`QueryGate`](crate::gate::QueryGate).
    /// Never reaches the database.
    #[error("unsafe query: {reason}")]
    UnsafeQuery { reason: String },

    /// The database rejected an already-validated query.
    #[error("query execution failed: {source} (query: {query})")]
    QueryExecution {
        query: String,
        #[source]
        source: sqlx::Error,
    },

    /// Table is not part of the allow-list.
    #[error("table not found: {0}")]
    UnknownTable(String),

    /// Non-forced creation of a collection that already exists.
    #[error("collection already exists: {name} (dims={dims}, distance={distance})")]
    CollectionExists {
        name: String,
        dims: usize,
        distance: String,
    },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("vector dimension mismatch in collection {collection}: expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    /// Failure from the external embedding collaborator. Fails the whole
    /// rebuild run; safe to retry.
    #[error("embedding provider failed for collection {collection}: {message}")]
    EmbeddingProvider { collection: String, message: String },

    /// Semantic records whose key no longer resolves to a relational row.
    #[error("consistency violation in collection {collection}: {} dangling record(s), rebuild recommended", dangling.len())]
    ConsistencyViolation {
        collection: String,
        dangling: Vec<String>,
    },

    /// Another rebuild holds the lease on this collection.
    #[error("rebuild already in progress for collection: {0}")]
    RebuildInProgress(String),

    /// A staged generation does not hold every row of its view; it is
    /// never committed.
    #[error("rebuild of collection {collection} staged {staged} of {expected} records; not committed")]
    IncompleteGeneration {
        collection: String,
        expected: usize,
        staged: i64,
    },

    #[error("invalid dataset: {0}")]
    Ingest(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub(crate) fn unsafe_query(reason: impl Into<String>) -> Self {
        Error::UnsafeQuery {
            reason: reason.into(),
        }
    }

    /// Machine-readable code used by the HTTP and MCP surfaces.
    pub fn code(&self) -> &'static str {
        match self {
            Error::UnsafeQuery { .. } => "unsafe_query",
            Error::QueryExecution { .. } => "query_execution",
            Error::UnknownTable(_) | Error::CollectionNotFound(_) => "not_found",
            Error::CollectionExists { .. } => "collection_exists",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::EmbeddingProvider { .. } => "embedding_provider",
            Error::ConsistencyViolation { .. } => "consistency_violation",
            Error::RebuildInProgress(_) => "rebuild_in_progress",
            Error::IncompleteGeneration { .. } => "incomplete_rebuild",
            Error::Ingest(_) => "bad_request",
            Error::Database(_) => "internal",
        }
    }
}
