use crate::{
    Batch, ChannelConfig, DeliveryOutcome, DeliveryPipeline, Destination, Error,
    PersistedBatchStore, RetryLoader, Sampler, TelemetryItem, Transport,
};
use std::sync::Arc;
use tracing::debug;

/// Samples, sends and, if necessary, persists telemetry for one destination.
///
/// Owns the whole delivery stack: a [`Sampler`], a [`DeliveryPipeline`], the
/// [`PersistedBatchStore`] and a [`RetryLoader`] draining it in the background.
///
/// ```no_run
/// # use opentelemetry_http::HttpClient;
/// # async fn run(client: impl HttpClient + 'static) -> Result<(), application_insights_delivery::Error> {
/// use application_insights_delivery::{
///     ChannelConfig, HttpTransport, TelemetryChannel, TelemetryItem, TelemetryKind,
/// };
/// use std::time::SystemTime;
///
/// let config = ChannelConfig::from_env()?;
/// let channel = TelemetryChannel::new(config, HttpTransport::new(client))?;
///
/// let item = TelemetryItem::new(TelemetryKind::Request, SystemTime::now())
///     .with_operation_id("4bf92f3577b34da6a3ce929d0e0e4736");
/// channel.track(vec![item]).await?;
///
/// channel.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TelemetryChannel {
    destination: Destination,
    sampler: Sampler,
    pipeline: Arc<DeliveryPipeline>,
    store: Arc<PersistedBatchStore>,
    retry_loader: RetryLoader,
}

impl TelemetryChannel {
    /// Open local storage and start the retry loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new(config: ChannelConfig, transport: impl Transport + 'static) -> Result<Self, Error> {
        let ChannelConfig {
            destination,
            sampling,
            storage,
            retry,
        } = config;
        let store = Arc::new(PersistedBatchStore::open(storage)?);
        let pipeline = Arc::new(DeliveryPipeline::new(transport));
        let retry_loader = RetryLoader::start(store.clone(), pipeline.clone(), retry);

        Ok(TelemetryChannel {
            destination,
            sampler: Sampler::new(&sampling),
            pipeline,
            store,
            retry_loader,
        })
    }

    /// Destination of all telemetry tracked through this channel.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Sampler applied to tracked items.
    pub fn sampler(&self) -> &Sampler {
        &self.sampler
    }

    /// Local storage holding batches awaiting retry.
    pub fn store(&self) -> &Arc<PersistedBatchStore> {
        &self.store
    }

    /// Sample the items and send the remaining ones as one batch.
    ///
    /// On a transient failure the batch is persisted and retried in the background. Returns
    /// `None` if every item was sampled out.
    pub async fn track(
        &self,
        items: impl IntoIterator<Item = TelemetryItem>,
    ) -> Result<Option<DeliveryOutcome>, Error> {
        let items: Vec<_> = items
            .into_iter()
            .filter_map(|mut item| self.sampler.process(&mut item).then_some(item))
            .collect();
        if items.is_empty() {
            return Ok(None);
        }

        let count = items.len();
        let batch = Batch::from_items(self.destination.clone(), items)?;
        let outcome = self.pipeline.send_or_persist(&batch, &self.store).await;
        debug!(items = count, outcome = ?outcome, "tracked telemetry");
        Ok(Some(outcome))
    }

    /// Stop the retry loop. Batches that were not delivered yet stay in local storage and are
    /// picked up by the next channel opened on the same directory.
    pub async fn shutdown(self) {
        self.retry_loader.shutdown().await;
    }
}
