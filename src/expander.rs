//! Request expander (component C4)
//!
//! Turns a polymorphic request spec into an ordered sequence of expanded
//! points and an axis descriptor list, clamping each axis to its declared
//! domain and converting dB-valued SNR to linear once, at expansion time.

use crate::error::AppError;
use crate::types::{
    AxisDescriptor, ExpandedPoint, Layout, Modulation, ParamValue, RequestSpec, SnrUnit,
};
use std::collections::BTreeMap;

/// Axes whose values must be integers. `RangeStep` on these axes is
/// rejected if `step` is not an integer; expanded values are rounded
/// half-to-even.
const INTEGER_AXES: &[&str] = &["n", "N"];

/// Axis-specific domain clamps, applied after expansion and unit
/// conversion. `None` means "no clamp beyond finiteness".
fn domain_floor(axis: &str) -> Option<f64> {
    match axis {
        "R" => Some(0.0),
        "SNR" => Some(0.0),
        _ => None,
    }
}

fn round_half_to_even(value: f64) -> f64 {
    let floor = value.floor();
    let diff = value - floor;
    if (diff - 0.5).abs() < f64::EPSILON {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        value.round()
    }
}

/// The outcome of expanding one axis: its expanded values and whether it
/// counts as "non-scalar" for layout/matrix purposes.
struct ExpandedAxis {
    name: String,
    values: Vec<f64>,
    non_scalar: bool,
    unit: Option<SnrUnit>,
}

fn expand_axis(name: &str, raw: &ParamValue) -> Result<ExpandedAxis, AppError> {
    let is_integer_axis = INTEGER_AXES.contains(&name);

    let (mut values, non_scalar) = match raw {
        ParamValue::Scalar { value } => (vec![*value], false),
        ParamValue::List { values } => {
            if values.is_empty() {
                return Err(AppError::InvalidParameter(format!(
                    "axis '{name}' has an empty list"
                )));
            }
            (values.clone(), true)
        }
        ParamValue::RangeStep { min, max, step } => {
            if *min > *max {
                return Err(AppError::InvalidParameter(format!(
                    "axis '{name}': min must be <= max"
                )));
            }
            if *step <= 0.0 {
                return Err(AppError::InvalidParameter(format!(
                    "axis '{name}': step must be > 0"
                )));
            }
            if is_integer_axis && step.fract() != 0.0 {
                return Err(AppError::InvalidParameter(format!(
                    "axis '{name}' is integer-only and rejects a non-integer step"
                )));
            }
            let count = ((*max - *min) / *step).floor() as u64 + 1;
            let values = (0..count).map(|i| min + (i as f64) * step).collect();
            (values, true)
        }
        ParamValue::RangePoints { min, max, points } => {
            if *min > *max {
                return Err(AppError::InvalidParameter(format!(
                    "axis '{name}': min must be <= max"
                )));
            }
            if *points == 0 {
                return Err(AppError::InvalidParameter(format!(
                    "axis '{name}': points must be >= 1"
                )));
            }
            let values = if *points == 1 {
                vec![*min]
            } else {
                let step = (*max - *min) / ((*points - 1) as f64);
                (0..*points).map(|i| min + (i as f64) * step).collect()
            };
            (values, true)
        }
    };

    if is_integer_axis {
        for value in values.iter_mut() {
            *value = round_half_to_even(*value);
        }
    }

    // `unit` is filled in by the caller for the "SNR" axis, which is the
    // only one with a declared unit — it needs the modulation descriptor's
    // `snrUnit` field, which this function does not have access to.
    Ok(ExpandedAxis {
        name: name.to_string(),
        values,
        non_scalar,
        unit: None,
    })
}

fn clamp_axis(name: &str, values: &mut [f64]) -> Result<(), AppError> {
    if let Some(floor) = domain_floor(name) {
        for value in values.iter() {
            if *value < floor {
                return Err(AppError::InvalidParameter(format!(
                    "axis '{name}' value {value} is below its domain floor {floor}"
                )));
            }
        }
    }
    if name == "M" {
        for value in values.iter() {
            if *value < 2.0 {
                return Err(AppError::InvalidParameter(
                    "M must be >= 2".to_string(),
                ));
            }
        }
    }
    Ok(())
}

pub struct ExpansionResult {
    pub points: Vec<ExpandedPoint>,
    pub axes: Vec<AxisDescriptor>,
    pub layout: Layout,
}

/// Expand a request spec into an ordered point list and axis descriptors.
///
/// `max_points` bounds the Cartesian product of non-scalar axis lengths;
/// exceeding it fails with `InvalidParameter` before any compute starts.
pub fn expand(spec: &RequestSpec, max_points: u64) -> Result<ExpansionResult, AppError> {
    if let Modulation::Standard { m, .. } = &spec.modulation {
        if *m < 2 {
            return Err(AppError::InvalidParameter("M must be >= 2".to_string()));
        }
    }
    if let Modulation::Custom { constellation } = &spec.modulation {
        if constellation.is_empty() {
            return Err(AppError::InvalidParameter(
                "custom constellation must not be empty".to_string(),
            ));
        }
        let total: f64 = constellation.iter().map(|p| p.prob).sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(AppError::InvalidParameter(format!(
                "custom constellation probabilities must sum to 1 (got {total})"
            )));
        }
    }

    let snr_unit = match &spec.modulation {
        Modulation::Standard { snr_unit, .. } => Some(*snr_unit),
        Modulation::Custom { .. } => None,
    };

    let mut expanded_axes = Vec::with_capacity(spec.axes.len());
    for (name, raw) in &spec.axes {
        let mut axis = expand_axis(name, raw)?;
        if name == "SNR" {
            if let Some(SnrUnit::Db) = snr_unit {
                for value in axis.values.iter_mut() {
                    *value = 10f64.powf(*value / 10.0);
                }
            }
            axis.unit = snr_unit;
        }
        clamp_axis(name, &mut axis.values)?;
        expanded_axes.push(axis);
    }

    let non_scalar: Vec<&ExpandedAxis> = expanded_axes.iter().filter(|a| a.non_scalar).collect();

    let product: u64 = expanded_axes
        .iter()
        .map(|a| a.values.len() as u64)
        .try_fold(1u64, |acc, len| acc.checked_mul(len))
        .ok_or_else(|| AppError::InvalidParameter("axis product overflows".to_string()))?;
    if product > max_points {
        return Err(AppError::InvalidParameter(format!(
            "request expands to {product} points, exceeding the limit of {max_points}"
        )));
    }

    let layout = if spec.format == Layout::Matrix && non_scalar.len() == 2 {
        Layout::Matrix
    } else {
        Layout::Flat
    };

    let axis_descriptors = non_scalar
        .iter()
        .map(|a| AxisDescriptor {
            name: a.name.clone(),
            values: a.values.clone(),
            unit: a.unit,
        })
        .collect();

    // Row-major Cartesian product over every axis, in declared order.
    let mut points = Vec::with_capacity(product as usize);
    let mut indices = vec![0usize; expanded_axes.len()];
    loop {
        let mut params = BTreeMap::new();
        for (axis, &idx) in expanded_axes.iter().zip(indices.iter()) {
            params.insert(axis.name.clone(), axis.values[idx]);
        }
        points.push(ExpandedPoint {
            params,
            modulation: spec.modulation.clone(),
            metrics: spec.metrics.clone(),
            layout,
        });

        // Odometer increment, least-significant (last) axis first.
        let mut carry = expanded_axes.len();
        while carry > 0 {
            carry -= 1;
            indices[carry] += 1;
            if indices[carry] < expanded_axes[carry].values.len() {
                break;
            }
            indices[carry] = 0;
            if carry == 0 {
                carry = usize::MAX;
                break;
            }
        }
        if carry == usize::MAX || expanded_axes.is_empty() {
            break;
        }
    }

    Ok(ExpansionResult {
        points,
        axes: axis_descriptors,
        layout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metric, ModulationKind};
    use indexmap::IndexMap;

    fn base_spec(axes: IndexMap<String, ParamValue>, format: Layout) -> RequestSpec {
        RequestSpec {
            axes,
            modulation: Modulation::Standard {
                m: 4,
                kind: ModulationKind::Pam,
                snr_unit: SnrUnit::Linear,
            },
            metrics: vec![Metric::ErrorExponent],
            format,
        }
    }

    #[test]
    fn no_non_scalar_axes_yields_one_point() {
        let mut axes = IndexMap::new();
        axes.insert("SNR".to_string(), ParamValue::Scalar { value: 5.0 });
        let spec = base_spec(axes, Layout::Flat);
        let result = expand(&spec, 10_000).unwrap();
        assert_eq!(result.points.len(), 1);
        assert!(result.axes.is_empty());
        assert_eq!(result.layout, Layout::Flat);
    }

    #[test]
    fn range_points_with_one_point_yields_min() {
        let mut axes = IndexMap::new();
        axes.insert(
            "SNR".to_string(),
            ParamValue::RangePoints { min: 3.0, max: 9.0, points: 1 },
        );
        let spec = base_spec(axes, Layout::Flat);
        let result = expand(&spec, 10_000).unwrap();
        assert_eq!(result.axes[0].values, vec![3.0]);
    }

    #[test]
    fn range_points_inclusive_of_both_endpoints() {
        let mut axes = IndexMap::new();
        axes.insert(
            "SNR".to_string(),
            ParamValue::RangePoints { min: 0.0, max: 10.0, points: 11 },
        );
        let spec = base_spec(axes, Layout::Flat);
        let result = expand(&spec, 10_000).unwrap();
        let values = &result.axes[0].values;
        assert_eq!(values.len(), 11);
        assert_eq!(values.first().copied(), Some(0.0));
        assert_eq!(values.last().copied(), Some(10.0));
    }

    #[test]
    fn range_step_count_matches_formula() {
        let mut axes = IndexMap::new();
        axes.insert(
            "SNR".to_string(),
            ParamValue::RangeStep { min: 0.0, max: 10.0, step: 2.0 },
        );
        let spec = base_spec(axes, Layout::Flat);
        let result = expand(&spec, 10_000).unwrap();
        assert_eq!(result.axes[0].values.len(), 6); // floor(10/2)+1
    }

    #[test]
    fn product_over_max_points_is_rejected() {
        let mut axes = IndexMap::new();
        axes.insert(
            "SNR".to_string(),
            ParamValue::RangePoints { min: 0.0, max: 100.0, points: 200 },
        );
        axes.insert(
            "R".to_string(),
            ParamValue::RangePoints { min: 0.1, max: 1.0, points: 200 },
        );
        let spec = base_spec(axes, Layout::Flat);
        let err = expand(&spec, 10_000).unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter(_)));
    }

    #[test]
    fn matrix_layout_requires_exactly_two_non_scalar_axes() {
        let mut axes = IndexMap::new();
        axes.insert(
            "SNR".to_string(),
            ParamValue::RangePoints { min: 0.0, max: 4.0, points: 5 },
        );
        axes.insert(
            "R".to_string(),
            ParamValue::RangePoints { min: 0.1, max: 0.9, points: 3 },
        );
        let spec = base_spec(axes, Layout::Matrix);
        let result = expand(&spec, 10_000).unwrap();
        assert_eq!(result.layout, Layout::Matrix);
        assert_eq!(result.points.len(), 15);

        let mut axes_three = IndexMap::new();
        axes_three.insert(
            "SNR".to_string(),
            ParamValue::RangePoints { min: 0.0, max: 4.0, points: 5 },
        );
        axes_three.insert(
            "R".to_string(),
            ParamValue::RangePoints { min: 0.1, max: 0.9, points: 3 },
        );
        axes_three.insert(
            "n".to_string(),
            ParamValue::List { values: vec![10.0, 20.0] },
        );
        let spec_three = base_spec(axes_three, Layout::Matrix);
        let result_three = expand(&spec_three, 10_000).unwrap();
        assert_eq!(result_three.layout, Layout::Flat);
    }

    #[test]
    fn db_snr_is_converted_to_linear() {
        let mut axes = IndexMap::new();
        axes.insert("SNR".to_string(), ParamValue::Scalar { value: 0.0 });
        let mut spec = base_spec(axes, Layout::Flat);
        spec.modulation = Modulation::Standard {
            m: 4,
            kind: ModulationKind::Pam,
            snr_unit: SnrUnit::Db,
        };
        let result = expand(&spec, 10_000).unwrap();
        assert_eq!(result.points[0].params["SNR"], 1.0); // 0 dB -> linear 1.0
    }

    #[test]
    fn integer_axis_rejects_non_integer_step() {
        let mut axes = IndexMap::new();
        axes.insert(
            "n".to_string(),
            ParamValue::RangeStep { min: 10.0, max: 20.0, step: 0.5 },
        );
        let spec = base_spec(axes, Layout::Flat);
        let err = expand(&spec, 10_000).unwrap_err();
        assert!(matches!(err, AppError::InvalidParameter(_)));
    }
}
