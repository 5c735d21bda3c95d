//! Shared type definitions
//!
//! The request/response data model: polymorphic parameter specs, the
//! modulation descriptor, axis descriptors, and the unified result schema.
//! All types are designed to be serializable for API communication and use
//! a small, fixed set of named records rather than an open schema — see
//! DESIGN.md for the corresponding "multi-stage object construction with
//! dynamic fields" redesign note.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

/// A single named axis value: either a scalar, an explicit list, a step
/// range, or a point-count range. `min ≤ max`, `step > 0`, `points ≥ 1` are
/// validated at expansion time, not at deserialization time, because the
/// raw `min`/`max` bounds also need axis-specific domain clamping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ParamValue {
    Scalar { value: f64 },
    List { values: Vec<f64> },
    RangeStep { min: f64, max: f64, step: f64 },
    RangePoints { min: f64, max: f64, points: u32 },
}

/// Units in which an SNR-valued axis may be expressed. Conversion to linear
/// happens once, at expansion time (see `expander.rs`), and the axis
/// descriptor records the unit the caller used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnrUnit {
    Db,
    Linear,
}

/// Standard constellation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModulationKind {
    Pam,
    Psk,
    Qam,
}

/// One point of a custom constellation: `(real, imag, prob)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConstellationPoint {
    pub real: f64,
    pub imag: f64,
    pub prob: f64,
}

/// The modulation descriptor: either a standard `{M, kind, snrUnit}` triple
/// or an explicit constellation. `Σ prob = 1 ± 1e-6` is validated for the
/// custom variant at expansion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Modulation {
    Standard {
        #[serde(rename = "M")]
        m: u32,
        kind: ModulationKind,
        #[serde(rename = "snrUnit")]
        snr_unit: SnrUnit,
    },
    Custom {
        constellation: Vec<ConstellationPoint>,
    },
}

/// The metrics a request may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ErrorProbability,
    ErrorExponent,
    OptimalRho,
    MutualInformation,
    CutoffRate,
    CriticalRate,
}

impl Metric {
    pub fn key(self) -> &'static str {
        match self {
            Metric::ErrorProbability => "error_probability",
            Metric::ErrorExponent => "error_exponent",
            Metric::OptimalRho => "optimal_rho",
            Metric::MutualInformation => "mutual_information",
            Metric::CutoffRate => "cutoff_rate",
            Metric::CriticalRate => "critical_rate",
        }
    }

    /// Whether this metric costs materially more than the baseline — used
    /// by the cost calculator's per-point complexity factor.
    pub fn is_high_order(self) -> bool {
        matches!(self, Metric::MutualInformation | Metric::CutoffRate)
    }
}

/// Result layout hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    Flat,
    Matrix,
}

/// The request spec as received from a client: a mapping of named axes to
/// `ParamValue`, a modulation descriptor, the metrics requested, and a
/// layout hint.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RequestSpec {
    /// Declared axis order matters: for `matrix` layout, the first two
    /// non-scalar axes in this order become the matrix's row/column axes.
    pub axes: IndexMap<String, ParamValue>,
    pub modulation: Modulation,
    #[validate(length(min = 1, message = "at least one metric must be requested"))]
    pub metrics: Vec<Metric>,
    #[serde(default = "default_layout")]
    pub format: Layout,
}

fn default_layout() -> Layout {
    Layout::Flat
}

/// One non-scalar axis as it appears in the response: its declared name,
/// the expanded values in declared order, and an optional unit label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisDescriptor {
    pub name: String,
    pub values: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<SnrUnit>,
}

/// A fully concrete assignment of every input axis, plus the modulation
/// descriptor. Two expanded points are equal iff their fingerprints match.
/// `layout` is carried so that two otherwise-identical points requested
/// under different layouts never share a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpandedPoint {
    pub params: BTreeMap<String, f64>,
    pub modulation: Modulation,
    pub metrics: Vec<Metric>,
    pub layout: Layout,
}

/// The computed metrics for one expanded point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultPoint {
    pub params: BTreeMap<String, f64>,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub cached: bool,
    #[serde(rename = "computation_time_ms")]
    pub computation_time_ms: u64,
}

/// Either a flat sequence or a rectangular 2-D array of result points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultGrid {
    Flat(Vec<ResultPoint>),
    Matrix(Vec<Vec<ResultPoint>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub total_points: u64,
    pub cached_points: u64,
    pub total_computation_time_ms: u64,
}

/// The unified result schema returned by both compute endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeResponse {
    pub format: Layout,
    pub axes: Vec<AxisDescriptor>,
    pub results: ResultGrid,
    pub meta: ResponseMeta,
}
