use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Application Insights telemetry type, derived from the envelope name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryKind {
    /// Incoming request handled by the application.
    Request,
    /// Outgoing call to a dependency.
    RemoteDependency,
    /// Custom event.
    Event,
    /// Exception.
    Exception,
    /// Browser page view.
    PageView,
    /// Trace message. Configuration calls this type `Trace`.
    Message,
    /// Metric.
    Metric,
    /// Performance counter.
    PerformanceCounter,
    /// Session state change.
    SessionState,
    /// Availability test result.
    Availability,
}

impl TelemetryKind {
    /// Suffix used in envelope names, e.g. `Microsoft.ApplicationInsights.Request`.
    pub fn envelope_suffix(self) -> &'static str {
        match self {
            TelemetryKind::Request => "Request",
            TelemetryKind::RemoteDependency => "RemoteDependency",
            TelemetryKind::Event => "Event",
            TelemetryKind::Exception => "Exception",
            TelemetryKind::PageView => "PageView",
            TelemetryKind::Message => "Message",
            TelemetryKind::Metric => "Metric",
            TelemetryKind::PerformanceCounter => "PerformanceCounter",
            TelemetryKind::SessionState => "SessionState",
            TelemetryKind::Availability => "Availability",
        }
    }

    /// Determines the kind from an envelope name. Both the short form
    /// (`Microsoft.ApplicationInsights.Request`) and the form including the instrumentation key
    /// (`Microsoft.ApplicationInsights.<ikey>.Request`) are supported.
    pub fn from_envelope_name(name: &str) -> Option<Self> {
        let suffix = name.rsplit('.').next()?;
        match suffix {
            "Request" => Some(TelemetryKind::Request),
            "RemoteDependency" => Some(TelemetryKind::RemoteDependency),
            "Event" => Some(TelemetryKind::Event),
            "Exception" => Some(TelemetryKind::Exception),
            "PageView" => Some(TelemetryKind::PageView),
            "Message" => Some(TelemetryKind::Message),
            "Metric" => Some(TelemetryKind::Metric),
            "PerformanceCounter" => Some(TelemetryKind::PerformanceCounter),
            "SessionState" => Some(TelemetryKind::SessionState),
            "Availability" => Some(TelemetryKind::Availability),
            _ => None,
        }
    }

    /// Whether fixed rate sampling applies to this kind at all. Aggregated telemetry like metrics
    /// is never sampled, since the backend could not extrapolate it.
    pub fn is_sampleable(self) -> bool {
        matches!(
            self,
            TelemetryKind::Request
                | TelemetryKind::RemoteDependency
                | TelemetryKind::Event
                | TelemetryKind::Exception
                | TelemetryKind::PageView
                | TelemetryKind::Message
        )
    }
}

impl fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.envelope_suffix())
    }
}

/// Unknown telemetry type name in sampling configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown telemetry type \"{0}\"")]
pub struct UnknownTelemetryKind(pub String);

impl FromStr for TelemetryKind {
    type Err = UnknownTelemetryKind;

    /// Parses the type names used in sampling configuration. Only sampleable types are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "request" => Ok(TelemetryKind::Request),
            "dependency" | "remotedependency" => Ok(TelemetryKind::RemoteDependency),
            "event" => Ok(TelemetryKind::Event),
            "exception" => Ok(TelemetryKind::Exception),
            "pageview" => Ok(TelemetryKind::PageView),
            "trace" | "message" => Ok(TelemetryKind::Message),
            _ => Err(UnknownTelemetryKind(s.to_string())),
        }
    }
}
