//! Fan profile curves: the point model, evaluation, and validation rules.
//!
//! Profiles are owned by the hub; agents receive the normalized point list
//! with every assignment change and only ever evaluate it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub temperature: f64,
    pub duty: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanProfile {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub profile_type: String,
    pub points: Vec<CurvePoint>,
    #[serde(default)]
    pub global: bool,
    /// Built-in profiles are read-only; edits clone into a new id.
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum CurveError {
    #[error("curve needs at least two points")]
    TooFewPoints,
    #[error("temperature {0} out of range 0-100")]
    TemperatureOutOfRange(f64),
    #[error("duty {0} out of range 0-100")]
    DutyOutOfRange(u8),
    #[error("duplicate temperature {0}")]
    DuplicateTemperature(f64),
}

/// Validate a user-authored curve: at least two points, both axes within
/// [0, 100], no duplicate temperatures.
pub fn validate_points(points: &[CurvePoint]) -> Result<(), CurveError> {
    if points.len() < 2 {
        return Err(CurveError::TooFewPoints);
    }
    for p in points {
        if !(0.0..=100.0).contains(&p.temperature) {
            return Err(CurveError::TemperatureOutOfRange(p.temperature));
        }
        if p.duty > 100 {
            return Err(CurveError::DutyOutOfRange(p.duty));
        }
    }
    let mut sorted: Vec<f64> = points.iter().map(|p| p.temperature).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    for w in sorted.windows(2) {
        if (w[0] - w[1]).abs() < f64::EPSILON {
            return Err(CurveError::DuplicateTemperature(w[0]));
        }
    }
    Ok(())
}

/// Sort points by temperature ascending. Evaluation assumes this order.
pub fn normalize_points(points: &mut [CurvePoint]) {
    points.sort_by(|a, b| a.temperature.partial_cmp(&b.temperature).unwrap());
}

/// Evaluate the curve at a temperature: linear interpolation between
/// adjacent points, clamped to the first/last point's duty outside the
/// covered range.
pub fn evaluate(points: &[CurvePoint], temp_c: f64) -> u8 {
    if points.is_empty() {
        return 0;
    }
    if temp_c <= points[0].temperature {
        return points[0].duty;
    }
    if temp_c >= points[points.len() - 1].temperature {
        return points[points.len() - 1].duty;
    }
    for w in points.windows(2) {
        let (a, b) = (&w[0], &w[1]);
        if temp_c >= a.temperature && temp_c <= b.temperature {
            let t = (temp_c - a.temperature) / (b.temperature - a.temperature);
            let v = a.duty as f64 + t * (b.duty as f64 - a.duty as f64);
            return v.round().clamp(0.0, 100.0) as u8;
        }
    }
    points[points.len() - 1].duty
}

impl FanProfile {
    pub fn validate(&self) -> Result<(), CurveError> {
        validate_points(&self.points)
    }

    pub fn evaluate(&self, temp_c: f64) -> u8 {
        evaluate(&self.points, temp_c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve() -> Vec<CurvePoint> {
        vec![
            CurvePoint { temperature: 30.0, duty: 20 },
            CurvePoint { temperature: 50.0, duty: 40 },
            CurvePoint { temperature: 65.0, duty: 70 },
            CurvePoint { temperature: 80.0, duty: 100 },
        ]
    }

    #[test]
    fn clamps_below_first_point() {
        assert_eq!(evaluate(&curve(), 10.0), 20);
        assert_eq!(evaluate(&curve(), 30.0), 20);
    }

    #[test]
    fn clamps_above_last_point() {
        assert_eq!(evaluate(&curve(), 80.0), 100);
        assert_eq!(evaluate(&curve(), 95.0), 100);
    }

    #[test]
    fn interpolates_between_points() {
        assert_eq!(evaluate(&curve(), 40.0), 30);
        assert_eq!(evaluate(&curve(), 57.5), 55);
        // Scenario values from the shipped default curve
        assert_eq!(evaluate(&curve(), 57.0), 54);
        assert_eq!(evaluate(&curve(), 70.0), 80);
    }

    #[test]
    fn empty_curve_yields_zero() {
        assert_eq!(evaluate(&[], 50.0), 0);
    }

    #[test]
    fn single_point_always_wins() {
        let points = [CurvePoint { temperature: 50.0, duty: 75 }];
        assert_eq!(evaluate(&points, 30.0), 75);
        assert_eq!(evaluate(&points, 70.0), 75);
    }

    #[test]
    fn validation_rejects_bad_curves() {
        assert_eq!(
            validate_points(&[CurvePoint { temperature: 30.0, duty: 20 }]),
            Err(CurveError::TooFewPoints)
        );
        assert_eq!(
            validate_points(&[
                CurvePoint { temperature: -1.0, duty: 20 },
                CurvePoint { temperature: 50.0, duty: 40 },
            ]),
            Err(CurveError::TemperatureOutOfRange(-1.0))
        );
        assert_eq!(
            validate_points(&[
                CurvePoint { temperature: 30.0, duty: 120 },
                CurvePoint { temperature: 50.0, duty: 40 },
            ]),
            Err(CurveError::DutyOutOfRange(120))
        );
        assert_eq!(
            validate_points(&[
                CurvePoint { temperature: 30.0, duty: 20 },
                CurvePoint { temperature: 30.0, duty: 40 },
            ]),
            Err(CurveError::DuplicateTemperature(30.0))
        );
        assert!(validate_points(&curve()).is_ok());
    }

    #[test]
    fn normalize_sorts_by_temperature() {
        let mut points = vec![
            CurvePoint { temperature: 80.0, duty: 100 },
            CurvePoint { temperature: 30.0, duty: 20 },
        ];
        normalize_points(&mut points);
        assert_eq!(points[0].temperature, 30.0);
    }
}
