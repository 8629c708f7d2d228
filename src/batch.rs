use crate::{Destination, Error, TelemetryItem};
use bytes::Bytes;
use flate2::{write::GzEncoder, Compression};
use std::io::Write;

/// An immutable group of serialized telemetry items plus where they have to go.
///
/// The payload is opaque to the delivery core. A batch is accepted, persisted or dropped as a
/// whole; it is never split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    destination: Destination,
    payload: Bytes,
}

impl Batch {
    /// Wrap an already serialized payload.
    pub fn new(destination: Destination, payload: impl Into<Bytes>) -> Self {
        Batch {
            destination,
            payload: payload.into(),
        }
    }

    /// Serialize items as newline delimited JSON and gzip the result.
    ///
    /// Items without an instrumentation key get the destination's key.
    pub fn from_items(destination: Destination, items: Vec<TelemetryItem>) -> Result<Self, Error> {
        let payload = serialize_request_body(&destination, items)?;
        Ok(Batch::new(destination, payload))
    }

    /// Routing attributes.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Instrumentation key of the destination.
    pub fn instrumentation_key(&self) -> &str {
        self.destination.instrumentation_key()
    }

    /// Track endpoint of the destination.
    pub fn endpoint(&self) -> &http::Uri {
        self.destination.endpoint()
    }

    /// Serialized, compressed telemetry.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

fn serialize_request_body(
    destination: &Destination,
    items: Vec<TelemetryItem>,
) -> Result<Vec<u8>, Error> {
    let mut serialized = Vec::new();
    for (i, mut item) in items.into_iter().enumerate() {
        if item.i_key.is_none() {
            item.i_key = Some(destination.instrumentation_key().to_string());
        }
        if i > 0 {
            serialized.push(b'\n');
        }
        serde_json::to_writer(&mut serialized, &item).map_err(Error::SerializeBatch)?;
    }

    let mut gzip_encoder = GzEncoder::new(Vec::new(), Compression::default());
    gzip_encoder
        .write_all(&serialized)
        .map_err(Error::CompressBatch)?;
    gzip_encoder.finish().map_err(Error::CompressBatch)
}
