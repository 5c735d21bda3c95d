//! Canonical fingerprinting for expanded points
//!
//! Produces a deterministic, collision-free (in practice) byte sequence
//! identifying a compute input: sorted axis values, fixed-width numeric
//! encoding, canonical constellation ordering, the requested metric set,
//! and the layout hint. Two expanded points are equal iff their
//! fingerprints are equal.

use crate::types::{ExpandedPoint, Layout, Metric, Modulation};
use sha2::{Digest, Sha256};

/// A 256-bit fingerprint, rendered as lowercase hex for use as a cache key
/// and in log lines (the fingerprint identifies the *input*, not any
/// secret, so it is safe to log).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

fn encode_f64(buf: &mut Vec<u8>, value: f64) {
    // Normalize -0.0 to 0.0 so the two compare as fingerprint-equal, as a
    // caller has no way to distinguish them in a numeric parameter.
    let normalized = if value == 0.0 { 0.0 } else { value };
    buf.extend_from_slice(&normalized.to_bits().to_be_bytes());
}

fn encode_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn encode_modulation(buf: &mut Vec<u8>, modulation: &Modulation) {
    match modulation {
        Modulation::Standard { m, kind, snr_unit } => {
            buf.push(0u8);
            buf.extend_from_slice(&(*m as i64).to_be_bytes());
            encode_str(buf, &format!("{kind:?}"));
            encode_str(buf, &format!("{snr_unit:?}"));
        }
        Modulation::Custom { constellation } => {
            buf.push(1u8);
            let mut points: Vec<_> = constellation.clone();
            points.sort_by(|a, b| {
                (a.real, a.imag, a.prob)
                    .partial_cmp(&(b.real, b.imag, b.prob))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            buf.extend_from_slice(&(points.len() as u64).to_be_bytes());
            for point in points {
                encode_f64(buf, point.real);
                encode_f64(buf, point.imag);
                encode_f64(buf, point.prob);
            }
        }
    }
}

/// Build the canonical fingerprint for one expanded point.
///
/// Axis names are iterated in sorted order because `ExpandedPoint::params`
/// is a `BTreeMap`, which already guarantees that regardless of the
/// insertion order the caller used when building the original request.
pub fn fingerprint(point: &ExpandedPoint) -> Fingerprint {
    let mut buf = Vec::new();

    buf.extend_from_slice(&(point.params.len() as u64).to_be_bytes());
    for (name, value) in &point.params {
        encode_str(&mut buf, name);
        encode_f64(&mut buf, *value);
    }

    encode_modulation(&mut buf, &point.modulation);

    let mut metrics: Vec<Metric> = point.metrics.clone();
    metrics.sort();
    metrics.dedup();
    buf.extend_from_slice(&(metrics.len() as u64).to_be_bytes());
    for metric in metrics {
        encode_str(&mut buf, metric.key());
    }

    buf.push(match point.layout {
        Layout::Flat => 0u8,
        Layout::Matrix => 1u8,
    });

    let mut hasher = Sha256::new();
    hasher.update(&buf);
    Fingerprint(hasher.finalize().into())
}
