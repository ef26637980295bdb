use std::io;
use thiserror::Error;

/// Error type for restructure operations.
#[derive(Error, Debug)]
pub enum RestructureError {
    /// IO error from file or stream operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Error reading or writing a record container file.
    #[error("Avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    /// CSV serialization/deserialization error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file parse error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error from the redis lock or offset backend.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Zip archive error.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// A source file name that does not follow
    /// `topic+partition+offsetFrom+offsetTo.<ext>`.
    #[error("cannot parse file name: {0}")]
    InvalidFileName(String),

    /// A record whose shape the converter cannot map at all.
    #[error("cannot map record: {0}")]
    RecordMapping(String),

    /// Invalid configuration or command-line arguments.
    #[error("configuration error: {0}")]
    Config(String),

    /// Aggregated failure from a bulk cache operation.
    #[error("{failed} of {total} file caches failed; first: {first}")]
    CacheAggregate {
        /// Number of caches that failed.
        failed: usize,
        /// Number of caches the operation covered.
        total: usize,
        /// Message of the first failure.
        first: String,
    },

    /// Generic error message.
    #[error("{0}")]
    StringError(String),
}

/// Result type alias for restructure operations.
pub type Result<T> = std::result::Result<T, RestructureError>;
