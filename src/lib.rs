//! Sampling and reliable delivery of telemetry to [Azure Application Insights].
//!
//! [Azure Application Insights]: https://docs.microsoft.com/en-us/azure/azure-monitor/app/app-insights-overview
//!
//! **Disclaimer**: This is not an official Microsoft product.
//!
//! # Overview
//!
//! Telemetry flows through four stages:
//!
//! 1. A [`Sampler`] decides which [`TelemetryItem`]s are kept. All items of one operation (sharing
//!    the `ai.operation.id` tag) get the same [score](sampling_score), so a request is kept or
//!    dropped together with its dependencies, events and exceptions. Kept items are tagged with
//!    the applied percentage.
//! 2. Kept items are serialized into an immutable, gzipped [`Batch`].
//! 3. A [`DeliveryPipeline`] sends the batch through a [`Transport`] and classifies the result as
//!    [success, transient or permanent failure](DeliveryOutcome).
//! 4. Transiently failed batches are written to a [`PersistedBatchStore`], a bounded directory of
//!    batch files. A [`RetryLoader`] resubmits them in the background and deletes them only once
//!    they are delivered or permanently rejected.
//!
//! [`TelemetryChannel`] wires all of this up for one destination:
//!
//! ```no_run
//! # use opentelemetry_http::HttpClient;
//! # async fn run(client: impl HttpClient + 'static) -> Result<(), application_insights_delivery::Error> {
//! use application_insights_delivery::{
//!     ChannelConfig, HttpTransport, SamplingConfig, TelemetryChannel, TelemetryItem,
//!     TelemetryKind,
//! };
//! use std::time::SystemTime;
//!
//! let config = ChannelConfig::from_connection_string(
//!     "InstrumentationKey=0fdcec70-0ce5-4085-89d9-9ae8ead9af66",
//! )?
//! .with_sampling(SamplingConfig::default().with_percentage(25.0));
//! let channel = TelemetryChannel::new(config, HttpTransport::new(client))?;
//!
//! let item = TelemetryItem::new(TelemetryKind::Request, SystemTime::now())
//!     .with_operation_id("4bf92f3577b34da6a3ce929d0e0e4736");
//! channel.track(vec![item]).await?;
//!
//! channel.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Sampling spans
//!
//! With the `trace` feature (enabled by default), [`ApplicationInsightsSampler`] makes the same
//! decision for OpenTelemetry spans, scoring the trace id.
//!
//! # Environment variables
//!
//! [`ChannelConfig::from_env`] reads:
//!
//! | Variable                                  | Meaning                                |
//! | ----------------------------------------- | -------------------------------------- |
//! | `APPLICATIONINSIGHTS_CONNECTION_STRING`   | Connection string (required)           |
//! | `APPLICATIONINSIGHTS_SAMPLING_PERCENTAGE` | Sampling percentage, defaults to 100   |
//! | `APPLICATIONINSIGHTS_STORAGE_DIRECTORY`   | Directory for batches awaiting retry   |
#![deny(missing_docs, unreachable_pub, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(test, deny(warnings))]

mod batch;
mod channel;
mod config;
mod delivery;
mod destination;
mod error;
mod models;
mod retry;
mod sampling;
mod storage;
mod uploader;

pub use batch::Batch;
pub use channel::TelemetryChannel;
pub use config::{ChannelConfig, RetryConfig, SamplingConfig, StorageConfig};
pub use delivery::{DeliveryOutcome, DeliveryPipeline};
pub use destination::{Destination, ParseError};
pub use error::Error;
pub use models::{context_tag_keys, Tags, TelemetryItem, TelemetryKind, UnknownTelemetryKind};
pub use retry::{PassSummary, RetryLoader, RetryWorker};
#[cfg(feature = "trace")]
#[cfg_attr(docsrs, doc(cfg(feature = "trace")))]
pub use sampling::{ApplicationInsightsSampler, SAMPLE_RATE_ATTRIBUTE};
pub use sampling::{sampling_score, Sampler};
pub use storage::{PersistedBatch, PersistedBatchStore, PersistedRecord, StoreError, StoreStats};
pub use uploader::{HttpTransport, Transport, TransportResponse};
