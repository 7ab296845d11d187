//! Error types for the caching proxy

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the caching proxy
///
/// Covers request validation, store I/O, upstream transport, and tag
/// analysis failures. Validation errors are rendered to clients as a
/// GraphQL `errors` response; store errors are downgraded to cache misses
/// by the callers that observe them.
#[derive(Error, Debug)]
pub enum Error {
    /// GraphQL document could not be parsed
    #[error("GraphQL parse error: {0}")]
    Parse(String),

    /// Document defines multiple operations and no operation name was supplied
    #[error("operation name is required when multiple operations are defined")]
    MissingOperationName,

    /// The named operation does not exist in the document
    #[error("operation {0} does not exist in the document")]
    OperationNotFound(String),

    /// Operation type cannot be handled by the cache layer
    #[error("unknown operation type: {0}")]
    UnknownOperationType(String),

    /// Invalid caching configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Store I/O errors
    #[error("store error: {0}")]
    Store(String),

    /// Redis backend errors
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Upstream transport errors
    #[error("upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Tag analysis failed over a response payload
    #[error("tag analysis error: {0}")]
    TagAnalysis(String),

    /// Response payload has no `data` object to analyze
    #[error("query result: `data` field missing")]
    MissingData,

    /// Purge value kind not supported for type-key invalidation
    #[error("only support purging type key value int or string, got {0}")]
    UnsupportedTypeKeyValue(String),

    /// One or more tags failed to invalidate
    #[error("failed to invalidate tags: {}", .0.join(", "))]
    Invalidation(Vec<String>),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Client write errors
    #[error("client write error: {0}")]
    ClientWrite(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("internal error: {0}")]
    Internal(String),

    /// Any other error
    #[error("error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the error came from request validation rather than proxy
    /// internals. Validation errors are answered with a GraphQL `errors`
    /// body instead of an HTTP failure.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Parse(_)
                | Error::MissingOperationName
                | Error::OperationNotFound(_)
                | Error::UnknownOperationType(_)
        )
    }

    /// Error code exposed in the GraphQL error extensions
    pub fn code(&self) -> &'static str {
        match self {
            Error::Parse(_) => "GRAPHQL_PARSE_FAILED",
            Error::MissingOperationName => "OPERATION_NAME_REQUIRED",
            Error::OperationNotFound(_) => "OPERATION_NOT_FOUND",
            Error::UnknownOperationType(_) => "UNKNOWN_OPERATION_TYPE",
            Error::Config(_) => "INVALID_CONFIG",
            Error::Store(_) | Error::Redis(_) => "STORE_ERROR",
            Error::Upstream(_) => "UPSTREAM_ERROR",
            Error::TagAnalysis(_) | Error::MissingData => "TAG_ANALYSIS_ERROR",
            Error::UnsupportedTypeKeyValue(_) => "UNSUPPORTED_TYPE_KEY_VALUE",
            Error::Invalidation(_) => "INVALIDATION_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::ClientWrite(_) => "CLIENT_WRITE_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "UNKNOWN_ERROR",
        }
    }

    /// Render the error as a GraphQL response body:
    /// `{"errors": [{"message": ..., "extensions": {"code": ...}}]}`
    pub fn to_graphql_body(&self) -> serde_json::Value {
        serde_json::json!({
            "errors": [{
                "message": self.to_string(),
                "extensions": { "code": self.code() },
            }]
        })
    }
}
