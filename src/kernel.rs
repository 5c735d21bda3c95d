//! Kernel adapter (component C1)
//!
//! Closed-form evaluation of the communication-theory metrics for a single
//! expanded point: error probability, Gallager error exponent, the
//! rho-optimizing random-coding exponent, mutual information, cutoff rate,
//! and critical rate. Every function here is pure and safe to call
//! concurrently from distinct workers — no shared state, no I/O.

use crate::types::{ConstellationPoint, ExpandedPoint, Metric, Modulation};
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("numerical failure: {0}")]
    NumericalFailure(String),
}

/// `Q(x)`, the standard Gaussian tail probability, via the Abramowitz &
/// Stegun rational approximation (accurate to ~1e-7, adequate for a metric
/// the caller treats as an estimate, not a certified bound).
fn q_function(x: f64) -> f64 {
    if x < 0.0 {
        return 1.0 - q_function(-x);
    }
    let t = 1.0 / (1.0 + 0.2316419 * x);
    let poly = t
        * (0.319381530
            + t * (-0.356563782
                + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));
    let phi = (-x * x / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt();
    (phi * poly).clamp(0.0, 1.0)
}

/// Resolve a modulation descriptor into a constellation: explicit points
/// with uniform prior for standard modulations, or the caller-supplied
/// constellation unchanged.
fn constellation_points(modulation: &Modulation) -> Result<Vec<ConstellationPoint>, KernelError> {
    match modulation {
        Modulation::Custom { constellation } => Ok(constellation.clone()),
        Modulation::Standard { m, kind, .. } => {
            let m = *m;
            if m < 2 {
                return Err(KernelError::InvalidParameter("M must be >= 2".to_string()));
            }
            let prob = 1.0 / m as f64;
            let points = match kind {
                crate::types::ModulationKind::Pam => (0..m)
                    .map(|i| {
                        let level = 2.0 * i as f64 - (m as f64 - 1.0);
                        ConstellationPoint { real: level, imag: 0.0, prob }
                    })
                    .collect(),
                crate::types::ModulationKind::Psk => (0..m)
                    .map(|i| {
                        let theta = 2.0 * std::f64::consts::PI * i as f64 / m as f64;
                        ConstellationPoint { real: theta.cos(), imag: theta.sin(), prob }
                    })
                    .collect(),
                crate::types::ModulationKind::Qam => {
                    let side = (m as f64).sqrt().round() as u32;
                    if side * side != m {
                        return Err(KernelError::InvalidParameter(
                            "QAM requires a square M".to_string(),
                        ));
                    }
                    let mut points = Vec::with_capacity(m as usize);
                    for row in 0..side {
                        for col in 0..side {
                            let real = 2.0 * col as f64 - (side as f64 - 1.0);
                            let imag = 2.0 * row as f64 - (side as f64 - 1.0);
                            points.push(ConstellationPoint { real, imag, prob });
                        }
                    }
                    points
                }
            };
            Ok(points)
        }
    }
}

/// Average pairwise minimum distance, normalized by average symbol energy
/// and scaled by linear SNR — the sufficient statistic for the union-bound
/// error probability and the Bhattacharyya-style exponent terms below.
fn normalized_min_distance(points: &[ConstellationPoint], snr_linear: f64) -> f64 {
    let mean_energy: f64 = points.iter().map(|p| p.prob * (p.real * p.real + p.imag * p.imag)).sum();
    let mean_energy = mean_energy.max(1e-12);

    let mut min_dist_sq = f64::INFINITY;
    for (i, a) in points.iter().enumerate() {
        for b in points.iter().skip(i + 1) {
            let dx = a.real - b.real;
            let dy = a.imag - b.imag;
            let dist_sq = dx * dx + dy * dy;
            if dist_sq < min_dist_sq {
                min_dist_sq = dist_sq;
            }
        }
    }
    if !min_dist_sq.is_finite() {
        return 0.0;
    }
    (min_dist_sq / mean_energy * snr_linear).sqrt() / 2.0
}

/// Union-bound symbol error probability: `(M-1) * Q(d_min/2 * sqrt(SNR))`.
fn error_probability(points: &[ConstellationPoint], snr_linear: f64) -> f64 {
    let half_distance = normalized_min_distance(points, snr_linear);
    let pairs = (points.len().saturating_sub(1)) as f64;
    (pairs * q_function(half_distance)).clamp(0.0, 1.0)
}

/// Gallager's random-coding exponent `E0(rho)` for an equiprobable
/// constellation over an AWGN channel, evaluated via the Bhattacharyya-style
/// pairwise bound: `E0(rho) = -log2( (1/M^2) * sum_jk (P(y|j,k))^(1/(1+rho)) )`
/// approximated in closed form through pairwise Gaussian overlap integrals.
fn e0(rho: f64, points: &[ConstellationPoint], snr_linear: f64) -> f64 {
    let m = points.len() as f64;
    let mut sum = 0.0;
    for a in points {
        for b in points {
            let dx = a.real - b.real;
            let dy = a.imag - b.imag;
            let dist_sq = dx * dx + dy * dy;
            // Bhattacharyya-style overlap for two equal-variance Gaussians
            // separated by `dist_sq`, raised to the (1+rho) exponent family.
            let overlap = (-dist_sq * snr_linear / (4.0 * (1.0 + rho))).exp();
            sum += overlap.powf(1.0 + rho) * a.prob.max(1e-12) * b.prob.max(1e-12) * m * m;
        }
    }
    let sum = (sum / (m * m)).max(1e-300);
    -sum.log2()
}

/// Maximize `E0(rho) - rho*R` over `rho in [0, 1]` via golden-section
/// search. Returns `(rho*, exponent)`.
fn golden_section_optimal_rho(
    points: &[ConstellationPoint],
    snr_linear: f64,
    rate: f64,
) -> (f64, f64) {
    let objective = |rho: f64| e0(rho, points, snr_linear) - rho * rate;

    let phi = (5f64.sqrt() - 1.0) / 2.0;
    let (mut lo, mut hi) = (0.0f64, 1.0f64);
    let mut c = hi - phi * (hi - lo);
    let mut d = lo + phi * (hi - lo);
    let mut fc = objective(c);
    let mut fd = objective(d);

    for _ in 0..60 {
        if (hi - lo).abs() < 1e-10 {
            break;
        }
        if fc > fd {
            hi = d;
            d = c;
            fd = fc;
            c = hi - phi * (hi - lo);
            fc = objective(c);
        } else {
            lo = c;
            c = d;
            fc = fd;
            d = lo + phi * (hi - lo);
            fd = objective(d);
        }
    }
    let rho_star = (lo + hi) / 2.0;
    (rho_star, objective(rho_star))
}

/// Mutual information between an equiprobable constellation and its AWGN
/// output, via a Gauss-Hermite quadrature approximation of
/// `I = H(Y) - H(Y|X)` for a complex AWGN channel.
fn mutual_information(points: &[ConstellationPoint], snr_linear: f64) -> f64 {
    // 7-point Gauss-Hermite nodes/weights for the real axis; the complex
    // channel integral is separable into independent I/Q components scaled
    // by `sqrt(snr_linear)`.
    const NODES: [f64; 7] = [
        -2.651_961_356_835_233,
        -1.673_551_628_767_471,
        -0.816_287_882_858_965,
        0.0,
        0.816_287_882_858_965,
        1.673_551_628_767_471,
        2.651_961_356_835_233,
    ];
    const WEIGHTS: [f64; 7] = [
        0.000_971_781_245_099,
        0.054_515_582_819_127,
        0.425_607_252_610_128,
        0.810_264_617_556_808,
        0.425_607_252_610_128,
        0.054_515_582_819_127,
        0.000_971_781_245_099,
    ];

    let sqrt_snr = snr_linear.max(0.0).sqrt();
    let mut mi = 0.0;

    for tx in points {
        for (&nx, &wx) in NODES.iter().zip(WEIGHTS.iter()) {
            for (&ny, &wy) in NODES.iter().zip(WEIGHTS.iter()) {
                // Quadrature node scaled to the unit-variance AWGN draw
                // that would carry `tx` to the received point `y`.
                let noise_real = nx * std::f64::consts::SQRT_2;
                let noise_imag = ny * std::f64::consts::SQRT_2;
                let y_real = sqrt_snr * tx.real + noise_real;
                let y_imag = sqrt_snr * tx.imag + noise_imag;

                // p(y | tx) is exactly the injected-noise density; p(y) is
                // the prior-weighted mixture over every constellation point.
                let likelihood_tx = (-(noise_real * noise_real + noise_imag * noise_imag) / 2.0).exp();
                let mut marginal = 0.0;
                for other in points {
                    let dr = y_real - sqrt_snr * other.real;
                    let di = y_imag - sqrt_snr * other.imag;
                    marginal += other.prob * (-(dr * dr + di * di) / 2.0).exp();
                }
                let ratio = if marginal > 1e-300 {
                    likelihood_tx / marginal
                } else {
                    1.0
                };

                let weight = wx * wy / std::f64::consts::PI;
                mi += tx.prob * weight * ratio.max(1e-300).log2();
            }
        }
    }

    mi.clamp(0.0, (points.len() as f64).log2())
}

/// Cutoff rate `R0 = E0(1)` — Gallager's exponent evaluated at `rho = 1`.
fn cutoff_rate(points: &[ConstellationPoint], snr_linear: f64) -> f64 {
    e0(1.0, points, snr_linear)
}

/// Critical rate: the rate at which the optimizing `rho*` reaches 1, i.e.
/// `Rcr = dE0/drho` evaluated at `rho = 1` (the boundary between the
/// exponential and sphere-packing regions of the reliability function).
fn critical_rate(points: &[ConstellationPoint], snr_linear: f64) -> f64 {
    let h = 1e-4;
    let e0_at_1 = e0(1.0, points, snr_linear);
    let e0_below = e0(1.0 - h, points, snr_linear);
    (e0_at_1 - e0_below) / h
}

/// Evaluate every requested metric for one expanded point. A point that
/// fails numerically for one metric still returns `None` for that metric
/// key rather than failing the whole point — callers never see a partial
/// success as a hard error.
pub fn compute(point: &ExpandedPoint) -> Result<BTreeMap<String, Option<f64>>, KernelError> {
    let points = constellation_points(&point.modulation)?;
    let snr_linear = *point.params.get("SNR").unwrap_or(&1.0);
    let rate = *point.params.get("R").unwrap_or(&0.5);

    let mut results = BTreeMap::new();
    for metric in &point.metrics {
        let value = match metric {
            Metric::ErrorProbability => Some(error_probability(&points, snr_linear)),
            Metric::ErrorExponent => {
                let (_, exponent) = golden_section_optimal_rho(&points, snr_linear, rate);
                Some(exponent.max(0.0))
            }
            Metric::OptimalRho => {
                let (rho, _) = golden_section_optimal_rho(&points, snr_linear, rate);
                Some(rho)
            }
            Metric::MutualInformation => Some(mutual_information(&points, snr_linear)),
            Metric::CutoffRate => Some(cutoff_rate(&points, snr_linear)),
            Metric::CriticalRate => Some(critical_rate(&points, snr_linear)),
        };
        let value = value.filter(|v| v.is_finite());
        results.insert(metric.key().to_string(), value);
    }
    Ok(results)
}
