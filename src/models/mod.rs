pub mod context_tag_keys;
mod envelope;
mod telemetry_kind;

pub use envelope::*;
pub use telemetry_kind::*;
