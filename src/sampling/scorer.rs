//! Sampling score for a telemetry item.
//!
//! Items of the same operation must get the same score, in every process, so that a trace is kept
//! or dropped as a whole. The score is derived from a DJB2 hash of the operation id and matches
//! the score other Application Insights SDKs compute for the same id.

use rand::Rng;

const DJB2_SEED: i32 = 5381;
const MIN_HASHED_LEN: usize = 8;

/// Score in `[0, 100)` used to decide whether an item is sampled in.
///
/// Non-empty operation ids always map to the same score. An empty operation id gets a random
/// score, so uncorrelated items are judged independently.
pub fn sampling_score(operation_id: &str) -> f64 {
    if operation_id.is_empty() {
        return rand::rng().random::<f64>() * 100.0;
    }

    (sampling_hash(operation_id) as f64 / i32::MAX as f64) * 100.0
}

/// DJB2 over the UTF-16 code units of the input, repeated to at least 8 units. The result is in
/// `[0, i32::MAX)`.
fn sampling_hash(input: &str) -> i32 {
    let units: Vec<u16> = input.encode_utf16().collect();
    let mut padded = units.clone();
    while padded.len() < MIN_HASHED_LEN {
        padded.extend_from_slice(&units);
    }

    let hash = padded.iter().fold(DJB2_SEED, |hash, unit| {
        hash.wrapping_mul(33).wrapping_add(i32::from(*unit))
    });

    if hash == i32::MIN || hash == i32::MAX {
        i32::MAX - 1
    } else {
        hash.abs()
    }
}
