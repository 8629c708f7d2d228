use crate::{destination::ParseError, storage::StoreError};

/// Errors that occurred while setting up delivery or assembling a batch.
///
/// Delivery failures themselves are not errors. They are reported as a
/// [`DeliveryOutcome`](crate::DeliveryOutcome) and handled inside this crate.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Telemetry items failed to serialize to JSON. The batch could not be assembled.
    ///
    /// Note: This is an error in this crate. If you spot this, please open an issue.
    #[error("serializing telemetry batch failed with {0}")]
    SerializeBatch(serde_json::Error),

    /// Telemetry items failed to compress. The batch could not be assembled.
    #[error("compressing telemetry batch failed with {0}")]
    CompressBatch(std::io::Error),

    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    ConnectionString(#[from] ParseError),

    /// A required environment variable is not set.
    #[error("environment variable {0} is not set")]
    MissingEnvironmentVariable(&'static str),

    /// The local storage directory could not be opened.
    #[error("opening local storage failed with {0}")]
    Storage(#[from] StoreError),
}
