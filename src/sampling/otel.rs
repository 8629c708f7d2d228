use crate::{config::validate_percentage, sampling::sampling_score};
use opentelemetry::{
    trace::{
        Link, SamplingDecision, SamplingResult, SpanKind, TraceContextExt, TraceId, TraceState,
    },
    Context, KeyValue,
};
use opentelemetry_sdk::trace::ShouldSample;

/// Span attribute carrying the applied sampling percentage.
pub const SAMPLE_RATE_ATTRIBUTE: &str = "microsoft.sample_rate";

/// OpenTelemetry sampler that makes the same decision as [`Sampler`](crate::Sampler).
///
/// The trace id is scored like an operation id, so spans and telemetry tracked directly through
/// a [`TelemetryChannel`](crate::TelemetryChannel) for the same trace are sampled consistently.
/// Spans with a sampled parent are always sampled. They don't get a
/// [`SAMPLE_RATE_ATTRIBUTE`], since the rate the parent was sampled at is unknown.
///
/// ```
/// use application_insights_delivery::ApplicationInsightsSampler;
/// use opentelemetry_sdk::trace::SdkTracerProvider;
///
/// let provider = SdkTracerProvider::builder()
///     .with_sampler(ApplicationInsightsSampler::new(25.0))
///     .build();
/// # drop(provider);
/// ```
#[derive(Debug, Clone)]
pub struct ApplicationInsightsSampler {
    percentage: f64,
}

impl ApplicationInsightsSampler {
    /// Create a sampler keeping `percentage` percent of traces. Invalid values disable sampling.
    pub fn new(percentage: f64) -> Self {
        ApplicationInsightsSampler {
            percentage: validate_percentage(percentage),
        }
    }

    /// Applied sampling percentage.
    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    fn sampled(&self, attributes: Vec<KeyValue>, trace_state: TraceState) -> SamplingResult {
        SamplingResult {
            decision: SamplingDecision::RecordAndSample,
            attributes,
            trace_state,
        }
    }
}

impl ShouldSample for ApplicationInsightsSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        _name: &str,
        _span_kind: &SpanKind,
        _attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let parent = parent_context
            .filter(|cx| cx.has_active_span())
            .map(|cx| cx.span().span_context().clone());
        let trace_state = parent
            .as_ref()
            .map(|span_context| span_context.trace_state().clone())
            .unwrap_or_default();

        if parent.as_ref().map_or(false, |span_context| span_context.is_sampled()) {
            return self.sampled(Vec::new(), trace_state);
        }

        if sampling_score(&trace_id.to_string()) < self.percentage {
            let sample_rate = KeyValue::new(SAMPLE_RATE_ATTRIBUTE, self.percentage);
            self.sampled(vec![sample_rate], trace_state)
        } else {
            SamplingResult {
                decision: SamplingDecision::Drop,
                attributes: Vec::new(),
                trace_state,
            }
        }
    }
}
