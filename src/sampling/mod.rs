//! Fixed rate sampling.

#[cfg(feature = "trace")]
mod otel;
mod scorer;

#[cfg(feature = "trace")]
pub use otel::*;
pub use scorer::sampling_score;

use crate::{SamplingConfig, TelemetryItem, TelemetryKind};
use std::collections::HashSet;
use tracing::trace;

const NO_SAMPLING: f64 = 100.0;

/// Decides which telemetry items are kept.
///
/// All items of one operation share a score (see [`sampling_score`]), so a request and its
/// dependencies, events and exceptions are kept or dropped together.
#[derive(Debug, Clone)]
pub struct Sampler {
    percentage: f64,
    included_types: HashSet<TelemetryKind>,
    excluded_types: HashSet<TelemetryKind>,
}

impl Sampler {
    /// Create a sampler from configuration.
    pub fn new(config: &SamplingConfig) -> Self {
        Sampler {
            percentage: config.percentage(),
            included_types: config.included_types().clone(),
            excluded_types: config.excluded_types().clone(),
        }
    }

    /// Configured sampling percentage.
    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    /// Returns `true` if the item should be kept.
    ///
    /// A kept item is tagged with the percentage that was applied, so the backend can extrapolate
    /// counts. A percentage already set on the item takes precedence over the configured one.
    pub fn process(&self, item: &mut TelemetryItem) -> bool {
        let kind = match item.kind() {
            Some(kind) if kind.is_sampleable() => kind,
            _ => return true,
        };
        if self.excluded_types.contains(&kind)
            || (!self.included_types.is_empty() && !self.included_types.contains(&kind))
        {
            return true;
        }

        let percentage = item.sample_rate.unwrap_or(self.percentage);
        if percentage >= NO_SAMPLING {
            return true;
        }

        let score = sampling_score(item.operation_id().unwrap_or_default());
        if score < percentage {
            item.sample_rate = Some(percentage);
            true
        } else {
            trace!(kind = %kind, score, percentage, "item sampled out");
            false
        }
    }
}
