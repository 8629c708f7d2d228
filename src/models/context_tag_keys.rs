//! Well-known context tag keys.
//!
//! Only the keys the delivery core reads are listed here. Producers are free to set any other
//! Application Insights context tag on a [`TelemetryItem`](crate::TelemetryItem).

/// A unique identifier for the operation instance. The operation.id is created by either a request
/// or a page view. All other telemetry sets this to the value for the containing request or page
/// view. Operation.id is used for finding all the telemetry items for a specific operation
/// instance.
pub const OPERATION_ID: &str = "ai.operation.id";
