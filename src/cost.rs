//! Cost calculator (component C5)
//!
//! Turns an expanded request into a single non-negative integer cost used
//! by the circuit breaker's admission decision and by usage metering. Cost
//! is a function of point count, per-point complexity (constellation size,
//! metric mix), and a caller-supplied type multiplier (e.g. the breaker's
//! half-open cost multiplier).

use crate::types::{ExpandedPoint, Modulation};

/// Cost never drops below 1 (an empty sweep still books minimal overhead)
/// and never exceeds this ceiling, regardless of input size.
const MIN_COST: u64 = 1;
const MAX_COST: u64 = 1_000_000_000;

/// Per-point complexity scale derived from constellation size. Standard
/// modulations scale with `M`; custom constellations scale with their point
/// count. Costs grow sub-linearly (log2) since the kernel's per-point work
/// is dominated by a fixed number of golden-section iterations, not a
/// brute-force scan of the constellation.
fn constellation_factor(modulation: &Modulation) -> f64 {
    let size = match modulation {
        Modulation::Standard { m, .. } => *m as f64,
        Modulation::Custom { constellation } => constellation.len() as f64,
    };
    (size.max(2.0)).log2()
}

/// Multiplier applied when any requested metric is in the high-order set
/// (mutual information, cutoff rate — these integrate over the
/// constellation rather than evaluating a closed form once).
fn metric_factor(point: &ExpandedPoint) -> f64 {
    if point.metrics.iter().any(|m| m.is_high_order()) {
        3.0
    } else {
        1.0
    }
}

/// Compute the base cost of evaluating `points`, before any admission-time
/// multiplier (e.g. the breaker's half-open fraction) is applied.
pub fn base_cost(points: &[ExpandedPoint]) -> u64 {
    let total: f64 = points
        .iter()
        .map(|p| constellation_factor(&p.modulation) * metric_factor(p))
        .sum();
    let cost = total.round() as u64;
    cost.clamp(MIN_COST, MAX_COST)
}

/// Apply a non-negative type multiplier (e.g. breaker half-open cost
/// multiplier, or a request-type weighting) to a base cost, clamping to the
/// same bounds.
pub fn metered_cost(base: u64, multiplier: f64) -> u64 {
    let scaled = (base as f64) * multiplier.max(0.0);
    (scaled.round() as u64).clamp(MIN_COST, MAX_COST)
}
