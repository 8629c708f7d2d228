use crate::{Destination, Error, TelemetryKind};
use serde::{Deserialize, Deserializer};
use std::{collections::HashSet, path::PathBuf, time::Duration};
use tracing::warn;

const CONNECTION_STRING_ENV: &str = "APPLICATIONINSIGHTS_CONNECTION_STRING";
const SAMPLING_PERCENTAGE_ENV: &str = "APPLICATIONINSIGHTS_SAMPLING_PERCENTAGE";
const STORAGE_DIRECTORY_ENV: &str = "APPLICATIONINSIGHTS_STORAGE_DIRECTORY";

const NO_SAMPLING: f64 = 100.0;
const DEFAULT_CAPACITY_MEGABYTES: u64 = 10;
const MIN_CAPACITY_MEGABYTES: u64 = 1;
const MAX_CAPACITY_MEGABYTES: u64 = 1000;
const DEFAULT_MAX_FILES: usize = 10_000;
const DEFAULT_EXPIRY: Duration = Duration::from_secs(48 * 60 * 60);
const DEFAULT_STORAGE_FOLDER: &str = "applicationinsights";
const TRANSMISSIONS_FOLDER: &str = "transmissions";

/// Fixed rate sampling configuration.
///
/// Invalid values never disable telemetry: a malformed or out of range percentage falls back to
/// 100 (no sampling) and unknown type names are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawSamplingConfig")]
pub struct SamplingConfig {
    percentage: f64,
    included_types: HashSet<TelemetryKind>,
    excluded_types: HashSet<TelemetryKind>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        SamplingConfig {
            percentage: NO_SAMPLING,
            included_types: HashSet::new(),
            excluded_types: HashSet::new(),
        }
    }
}

impl SamplingConfig {
    /// Build from the raw configuration surface: a percentage string and lists of type names.
    pub fn from_raw<S: AsRef<str>>(
        percentage: Option<&str>,
        included_types: &[S],
        excluded_types: &[S],
    ) -> Self {
        SamplingConfig {
            percentage: percentage.map_or(NO_SAMPLING, parse_percentage),
            included_types: parse_kinds(included_types),
            excluded_types: parse_kinds(excluded_types),
        }
    }

    /// Set the sampling percentage. It should be of the form `100/N` for integer `N`, so counts
    /// can be extrapolated without bias.
    ///
    /// Default: 100
    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = validate_percentage(percentage);
        self
    }

    /// Only sample items of this kind (may be called multiple times).
    pub fn with_included_type(mut self, kind: TelemetryKind) -> Self {
        self.included_types.insert(kind);
        self
    }

    /// Never sample items of this kind (may be called multiple times). Exclusion wins over
    /// inclusion.
    pub fn with_excluded_type(mut self, kind: TelemetryKind) -> Self {
        self.excluded_types.insert(kind);
        self
    }

    /// Configured sampling percentage in `(0, 100]`.
    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    pub(crate) fn included_types(&self) -> &HashSet<TelemetryKind> {
        &self.included_types
    }

    pub(crate) fn excluded_types(&self) -> &HashSet<TelemetryKind> {
        &self.excluded_types
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPercentage {
    Number(f64),
    Text(String),
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawSamplingConfig {
    percentage: Option<RawPercentage>,
    included_types: Vec<String>,
    excluded_types: Vec<String>,
}

impl From<RawSamplingConfig> for SamplingConfig {
    fn from(raw: RawSamplingConfig) -> Self {
        let percentage = match raw.percentage {
            Some(RawPercentage::Number(percentage)) => validate_percentage(percentage),
            Some(RawPercentage::Text(text)) => parse_percentage(&text),
            None => NO_SAMPLING,
        };
        SamplingConfig {
            percentage,
            included_types: parse_kinds(&raw.included_types),
            excluded_types: parse_kinds(&raw.excluded_types),
        }
    }
}

/// Parse a sampling percentage from configuration, falling back to no sampling.
pub(crate) fn parse_percentage(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(percentage) => validate_percentage(percentage),
        Err(err) => {
            warn!(value = raw, error = %err, "invalid sampling percentage, sampling disabled");
            NO_SAMPLING
        }
    }
}

pub(crate) fn validate_percentage(percentage: f64) -> f64 {
    if percentage.is_finite() && percentage > 0.0 && percentage <= NO_SAMPLING {
        percentage
    } else {
        warn!(
            value = percentage,
            "sampling percentage must be in (0, 100], sampling disabled"
        );
        NO_SAMPLING
    }
}

fn parse_kinds<S: AsRef<str>>(names: &[S]) -> HashSet<TelemetryKind> {
    names
        .iter()
        .filter_map(|name| match name.as_ref().parse() {
            Ok(kind) => Some(kind),
            Err(err) => {
                warn!(error = %err, "ignoring telemetry type in sampling configuration");
                None
            }
        })
        .collect()
}

/// Local storage for batches that could not be delivered.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    /// Directory holding the persisted batches. Created if missing.
    pub directory: PathBuf,
    /// Maximum total size of persisted batches.
    pub max_bytes: u64,
    /// Maximum number of persisted batches.
    pub max_files: usize,
    /// Persisted batches older than this are deleted without being sent.
    #[serde(rename = "expirySeconds", deserialize_with = "deserialize_secs")]
    pub expiry: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            directory: std::env::temp_dir()
                .join(DEFAULT_STORAGE_FOLDER)
                .join(TRANSMISSIONS_FOLDER),
            max_bytes: DEFAULT_CAPACITY_MEGABYTES * 1024 * 1024,
            max_files: DEFAULT_MAX_FILES,
            expiry: DEFAULT_EXPIRY,
        }
    }
}

impl StorageConfig {
    /// Storage in the given directory with default limits.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        StorageConfig {
            directory: directory.into(),
            ..Default::default()
        }
    }

    /// Set the capacity in megabytes, clamped to `1..=1000`.
    ///
    /// Default: 10
    pub fn with_capacity_megabytes(mut self, megabytes: u64) -> Self {
        let clamped = megabytes.clamp(MIN_CAPACITY_MEGABYTES, MAX_CAPACITY_MEGABYTES);
        if clamped != megabytes {
            warn!(
                requested = megabytes,
                used = clamped,
                "storage capacity out of range"
            );
        }
        self.max_bytes = clamped * 1024 * 1024;
        self
    }

    /// Set the capacity in bytes. Unlike [`with_capacity_megabytes`](Self::with_capacity_megabytes)
    /// this is not clamped.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Set the maximum number of persisted batches.
    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    /// Set how long persisted batches are kept.
    ///
    /// Default: 48 hours
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }
}

/// Timing of the background retry loop.
///
/// Backoff for a destination that keeps failing is exponential with jitter: starting at
/// `min_backoff`, multiplied by `backoff_factor` after every consecutive transient failure, capped
/// at `max_backoff`. A `Retry-After` from the service extends the delay.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Wait time when nothing is ready to be sent.
    #[serde(rename = "idleIntervalMillis", deserialize_with = "deserialize_millis")]
    pub idle_interval: Duration,
    /// Pause after every sent batch.
    #[serde(rename = "dispatchIntervalMillis", deserialize_with = "deserialize_millis")]
    pub dispatch_interval: Duration,
    /// How often expired batches are purged.
    #[serde(rename = "purgeIntervalMillis", deserialize_with = "deserialize_millis")]
    pub purge_interval: Duration,
    /// Delay after the first transient failure of a destination.
    #[serde(rename = "minBackoffMillis", deserialize_with = "deserialize_millis")]
    pub min_backoff: Duration,
    /// Upper bound for the delay.
    #[serde(rename = "maxBackoffMillis", deserialize_with = "deserialize_millis")]
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_factor: f32,
    /// Randomize delays to avoid synchronized retries.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            idle_interval: Duration::from_secs(2),
            dispatch_interval: Duration::from_millis(100),
            purge_interval: Duration::from_secs(60 * 60),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5 * 60),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Set the wait time when nothing is ready to be sent.
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Set the pause after every sent batch.
    pub fn with_dispatch_interval(mut self, interval: Duration) -> Self {
        self.dispatch_interval = interval;
        self
    }

    /// Set minimum and maximum backoff.
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max.max(min);
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Everything a [`TelemetryChannel`](crate::TelemetryChannel) needs.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub(crate) destination: Destination,
    pub(crate) sampling: SamplingConfig,
    pub(crate) storage: StorageConfig,
    pub(crate) retry: RetryConfig,
}

impl ChannelConfig {
    /// Configuration with defaults for everything but the destination.
    pub fn new(destination: Destination) -> Self {
        ChannelConfig {
            destination,
            sampling: SamplingConfig::default(),
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Configuration from a connection string.
    pub fn from_connection_string(connection_string: impl AsRef<str>) -> Result<Self, Error> {
        let destination: Destination = connection_string.as_ref().parse()?;
        Ok(ChannelConfig::new(destination))
    }

    /// Configuration from the environment.
    ///
    /// Reads the connection string from `APPLICATIONINSIGHTS_CONNECTION_STRING`. Optionally reads
    /// `APPLICATIONINSIGHTS_SAMPLING_PERCENTAGE` and `APPLICATIONINSIGHTS_STORAGE_DIRECTORY`.
    pub fn from_env() -> Result<Self, Error> {
        let connection_string = std::env::var(CONNECTION_STRING_ENV)
            .map_err(|_| Error::MissingEnvironmentVariable(CONNECTION_STRING_ENV))?;
        let mut config = ChannelConfig::from_connection_string(connection_string)?;
        if let Ok(percentage) = std::env::var(SAMPLING_PERCENTAGE_ENV) {
            config.sampling.percentage = parse_percentage(&percentage);
        }
        if let Ok(directory) = std::env::var(STORAGE_DIRECTORY_ENV) {
            config.storage.directory = directory.into();
        }
        Ok(config)
    }

    /// Set the sampling configuration.
    pub fn with_sampling(self, sampling: SamplingConfig) -> Self {
        ChannelConfig { sampling, ..self }
    }

    /// Set the storage configuration.
    pub fn with_storage(self, storage: StorageConfig) -> Self {
        ChannelConfig { storage, ..self }
    }

    /// Set the retry configuration.
    pub fn with_retry(self, retry: RetryConfig) -> Self {
        ChannelConfig { retry, ..self }
    }

    /// Destination of all telemetry tracked through the channel.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }
}

fn deserialize_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_secs)
}

fn deserialize_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}
