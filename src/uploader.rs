use crate::DeliveryOutcome;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Uri};
use opentelemetry_http::{HttpClient, HttpError};
use serde::Deserialize;
use std::{fmt::Debug, time::Duration};

const STATUS_PARTIAL_CONTENT: u16 = 206;
const STATUS_REQUEST_TIMEOUT: u16 = 408;
const STATUS_TOO_MANY_REQUESTS: u16 = 429;
const STATUS_APPLICATION_INACTIVE: u16 = 439; // Quota
const STATUS_INTERNAL_SERVER_ERROR: u16 = 500;
const STATUS_SERVICE_UNAVAILABLE: u16 = 503;

/// What the ingestion endpoint answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Delay requested by the server through `Retry-After`.
    pub retry_after: Option<Duration>,
    /// Response body.
    pub body: Bytes,
}

impl TransportResponse {
    /// Response with the given status and no body.
    pub fn from_status(status: u16) -> Self {
        TransportResponse {
            status,
            retry_after: None,
            body: Bytes::new(),
        }
    }
}

/// Sends a payload to an ingestion endpoint.
///
/// Implementations are responsible for bounding the time a send may take. A timeout should be
/// reported as an error, which counts as a transient failure.
#[async_trait]
pub trait Transport: Debug + Send + Sync {
    /// Post a gzipped, newline delimited JSON payload.
    async fn send(
        &self,
        endpoint: &Uri,
        instrumentation_key: &str,
        payload: Bytes,
    ) -> Result<TransportResponse, HttpError>;
}

/// [`Transport`] on top of any OpenTelemetry [`HttpClient`].
///
/// With the `reqwest-client` feature, `reqwest::Client` can be used directly.
#[derive(Debug, Clone)]
pub struct HttpTransport<C> {
    client: C,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Wrap an HTTP client.
    pub fn new(client: C) -> Self {
        HttpTransport { client }
    }
}

#[async_trait]
impl<C: HttpClient> Transport for HttpTransport<C> {
    async fn send(
        &self,
        endpoint: &Uri,
        _instrumentation_key: &str,
        payload: Bytes,
    ) -> Result<TransportResponse, HttpError> {
        let request = Request::post(endpoint)
            .header(http::header::CONTENT_TYPE, "application/x-json-stream")
            .header(http::header::CONTENT_ENCODING, "gzip")
            .body(payload)?;

        let response = self.client.send_bytes(request).await?;

        let retry_after = response
            .headers()
            .get(http::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        Ok(TransportResponse {
            status: response.status().as_u16(),
            retry_after,
            body: response.into_body(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Transmission {
    items_received: usize,
    items_accepted: usize,
    errors: Vec<TransmissionItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransmissionItem {
    status_code: u16,
}

/// Map an ingestion response to a delivery outcome.
pub(crate) fn classify(response: &TransportResponse) -> DeliveryOutcome {
    let transient = DeliveryOutcome::TransientFailure {
        retry_after: response.retry_after,
    };
    match response.status {
        STATUS_PARTIAL_CONTENT => match serde_json::from_slice::<Transmission>(&response.body) {
            Ok(content) if content.items_received == content.items_accepted => {
                DeliveryOutcome::Success
            }
            Ok(content) if content.errors.iter().any(can_retry_item) => transient,
            Ok(_) => DeliveryOutcome::PermanentFailure,
            Err(_) => transient,
        },
        200..=299 => DeliveryOutcome::Success,
        STATUS_REQUEST_TIMEOUT | STATUS_TOO_MANY_REQUESTS | STATUS_APPLICATION_INACTIVE => {
            transient
        }
        500..=599 => transient,
        _ => DeliveryOutcome::PermanentFailure,
    }
}

/// Determines that a telemetry item can be re-send corresponding to this submission status
/// descriptor.
fn can_retry_item(item: &TransmissionItem) -> bool {
    item.status_code == STATUS_PARTIAL_CONTENT
        || item.status_code == STATUS_REQUEST_TIMEOUT
        || item.status_code == STATUS_TOO_MANY_REQUESTS
        || item.status_code == STATUS_APPLICATION_INACTIVE
        || item.status_code == STATUS_INTERNAL_SERVER_ERROR
        || item.status_code == STATUS_SERVICE_UNAVAILABLE
}
