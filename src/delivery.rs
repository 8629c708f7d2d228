use crate::{
    destination::{is_valid_endpoint, is_valid_instrumentation_key},
    uploader::classify,
    Batch, PersistedBatchStore, Transport,
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::{debug, error, warn};

/// Result of a delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint accepted the batch.
    Success,
    /// The attempt failed but is expected to succeed later, e.g. on timeouts, server errors or
    /// throttling. The batch should be persisted and retried.
    TransientFailure {
        /// Delay requested by the server, if any.
        retry_after: Option<Duration>,
    },
    /// The batch will never be accepted, e.g. because the destination is invalid or the
    /// endpoint rejected the request. The batch must be dropped.
    PermanentFailure,
}

impl DeliveryOutcome {
    /// Returns `true` for [`DeliveryOutcome::TransientFailure`].
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryOutcome::TransientFailure { .. })
    }
}

/// Why a destination was rejected before sending.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub(crate) enum ValidationError {
    #[error("invalid instrumentation key")]
    InvalidInstrumentationKey,
    #[error("invalid endpoint")]
    InvalidEndpoint,
}

/// Sends batches through a [`Transport`] and classifies the result.
///
/// The pipeline never persists anything itself. Callers decide what to do with a
/// [`DeliveryOutcome::TransientFailure`]; [`send_or_persist`](Self::send_or_persist) is the
/// producer side policy.
#[derive(Debug)]
pub struct DeliveryPipeline {
    transport: Arc<dyn Transport>,
    reported_invalid_keys: Mutex<HashSet<String>>,
}

impl DeliveryPipeline {
    /// Create a pipeline sending through `transport`.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_arc(Arc::new(transport))
    }

    /// Create a pipeline sending through a shared transport.
    pub fn from_arc(transport: Arc<dyn Transport>) -> Self {
        DeliveryPipeline {
            transport,
            reported_invalid_keys: Mutex::new(HashSet::new()),
        }
    }

    /// Attempt to deliver the batch once.
    ///
    /// Batches with a malformed instrumentation key or endpoint fail permanently without a
    /// network round trip. Transport errors count as transient failures.
    pub async fn send(&self, batch: &Batch) -> DeliveryOutcome {
        if let Err(err) = validate(batch) {
            self.report_invalid(batch, &err);
            return DeliveryOutcome::PermanentFailure;
        }

        let response = match self
            .transport
            .send(
                batch.endpoint(),
                batch.instrumentation_key(),
                batch.payload().clone(),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!(endpoint = %batch.endpoint(), error = %err, "sending batch failed");
                return DeliveryOutcome::TransientFailure { retry_after: None };
            }
        };

        let outcome = classify(&response);
        match outcome {
            DeliveryOutcome::Success => {}
            DeliveryOutcome::TransientFailure { .. } => {
                debug!(
                    endpoint = %batch.endpoint(),
                    status = response.status,
                    "batch not accepted, retry possible"
                );
            }
            DeliveryOutcome::PermanentFailure => {
                warn!(
                    endpoint = %batch.endpoint(),
                    status = response.status,
                    body = %String::from_utf8_lossy(&response.body),
                    "batch rejected, dropping it"
                );
            }
        }
        outcome
    }

    /// Attempt to deliver a fresh batch and persist it for retry on a transient failure.
    ///
    /// If persisting fails, e.g. because the store is full, the batch is dropped with a warning.
    pub async fn send_or_persist(
        &self,
        batch: &Batch,
        store: &PersistedBatchStore,
    ) -> DeliveryOutcome {
        let outcome = self.send(batch).await;
        if outcome.is_transient() {
            if let Err(err) = store.enqueue(batch) {
                warn!(
                    instrumentation_key = batch.instrumentation_key(),
                    error = %err,
                    "persisting batch for retry failed, dropping it"
                );
            }
        }
        outcome
    }

    fn report_invalid(&self, batch: &Batch, err: &ValidationError) {
        let first_time = self
            .reported_invalid_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(batch.instrumentation_key().to_string());
        if first_time {
            error!(
                instrumentation_key = batch.instrumentation_key(),
                endpoint = %batch.endpoint(),
                error = %err,
                "dropping telemetry for invalid destination"
            );
        }
    }
}

fn validate(batch: &Batch) -> Result<(), ValidationError> {
    if !is_valid_instrumentation_key(batch.instrumentation_key()) {
        return Err(ValidationError::InvalidInstrumentationKey);
    }
    if !is_valid_endpoint(batch.endpoint()) {
        return Err(ValidationError::InvalidEndpoint);
    }
    Ok(())
}
