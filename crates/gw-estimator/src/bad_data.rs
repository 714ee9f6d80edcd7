//! Post-estimation bad-data analysis.
//!
//! Two classic tests run over the residual vector of a converged
//! estimate: the global chi-square test on the weighted objective
//! `J = Σ (r/σ)²`, and the largest-normalized-residual test that ranks
//! individual measurements. A persistent offset across samples of one
//! sensor channel turns into a calibration suggestion.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use gw_core::MeasurementKey;

use crate::{Residual, StateEstimate};

/// Normalized residuals beyond this are flagged as suspect.
pub const SUSPECT_THRESHOLD: f64 = 3.0;
/// Normalized residuals between this and [`SUSPECT_THRESHOLD`] warrant
/// a closer look without triggering rejection.
pub const WARNING_THRESHOLD: f64 = 2.0;

/// Per-measurement verdict from the largest-normalized-residual test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Normal,
    Warning,
    Suspect,
}

/// One residual with its normalized value and verdict, ranked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedResidual {
    pub key: MeasurementKey,
    pub residual: f64,
    pub normalized: f64,
    pub classification: Classification,
}

/// Outcome of the bad-data tests on one estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadDataReport {
    /// Weighted sum of squared residuals
    pub chi_square: f64,
    /// Critical value at the requested confidence
    pub chi_critical: f64,
    pub degrees_of_freedom: usize,
    /// True when `chi_square > chi_critical`
    pub global_suspect: bool,
    /// All residuals, descending by |normalized|
    pub ranked: Vec<RankedResidual>,
}

impl BadDataReport {
    /// Measurements classified as suspect, in rank order.
    pub fn suspects(&self) -> impl Iterator<Item = &RankedResidual> {
        self.ranked
            .iter()
            .filter(|r| r.classification == Classification::Suspect)
    }

    /// The worst offender, if any residual exists.
    pub fn top_suspect(&self) -> Option<&RankedResidual> {
        self.ranked.first()
    }
}

fn classify(normalized: f64) -> Classification {
    let mag = normalized.abs();
    if mag > SUSPECT_THRESHOLD {
        Classification::Suspect
    } else if mag > WARNING_THRESHOLD {
        Classification::Warning
    } else {
        Classification::Normal
    }
}

/// Run the chi-square and largest-normalized-residual tests.
///
/// `confidence` is the chi-square test level, typically 0.95 or 0.99.
/// Degrees of freedom are clamped to at least one so barely redundant
/// measurement sets still get a defined critical value.
pub fn detect(estimate: &StateEstimate, confidence: f64) -> BadDataReport {
    let chi_square: f64 = estimate
        .residuals
        .iter()
        .map(|r| {
            let n = r.normalized();
            n * n
        })
        .sum();

    let m = estimate.residuals.len();
    let degrees_of_freedom = m.saturating_sub(estimate.num_states).max(1);
    let chi_critical = ChiSquared::new(degrees_of_freedom as f64)
        .map(|dist| dist.inverse_cdf(confidence))
        .unwrap_or(f64::INFINITY);

    let mut ranked: Vec<RankedResidual> = estimate
        .residuals
        .iter()
        .map(|r| {
            let normalized = r.normalized();
            RankedResidual {
                key: r.measurement.key(),
                residual: r.residual,
                normalized,
                classification: classify(normalized),
            }
        })
        .collect();
    ranked.sort_by(|a, b| {
        b.normalized
            .abs()
            .partial_cmp(&a.normalized.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    BadDataReport {
        chi_square,
        chi_critical,
        degrees_of_freedom,
        global_suspect: chi_square > chi_critical,
        ranked,
    }
}

/// A sensor-channel residual sample collected across estimation runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResidualSample {
    pub residual: f64,
    pub std_dev: f64,
}

impl From<&Residual> for ResidualSample {
    fn from(r: &Residual) -> Self {
        Self {
            residual: r.residual,
            std_dev: r.std_dev,
        }
    }
}

/// A proposed calibration record for a persistently biased channel.
///
/// Applying it as `corrected = (raw - bias) * scale` should pull the
/// channel's residuals back toward zero.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CalibrationSuggestion {
    pub key: MeasurementKey,
    pub bias: f64,
    pub scale: f64,
}

/// Minimum samples before a suggestion is made.
const MIN_SAMPLES: usize = 3;

/// Propose a calibration for a channel from its residual history.
///
/// Returns `None` when there are too few samples or the mean offset is
/// within noise (under one standard deviation). The bias is the mean
/// residual with sign flipped onto the raw reading; the scale shrinks a
/// channel whose residual spread exceeds its claimed accuracy.
pub fn suggest_calibration(
    key: MeasurementKey,
    samples: &[ResidualSample],
) -> Option<CalibrationSuggestion> {
    if samples.len() < MIN_SAMPLES {
        return None;
    }
    let n = samples.len() as f64;
    let mean_residual = samples.iter().map(|s| s.residual).sum::<f64>() / n;
    let mean_sigma = samples.iter().map(|s| s.std_dev).sum::<f64>() / n;
    if mean_residual.abs() < mean_sigma {
        return None;
    }

    let mean_norm = samples.iter().map(|s| s.residual / s.std_dev).sum::<f64>() / n;
    let var_norm = samples
        .iter()
        .map(|s| {
            let d = s.residual / s.std_dev - mean_norm;
            d * d
        })
        .sum::<f64>()
        / n;
    let spread = var_norm.sqrt();
    let scale = if spread > 1.0 {
        (1.0 / spread).clamp(0.5, 1.0)
    } else {
        1.0
    };

    // residual = z - h, so a positive mean means the sensor reads high
    Some(CalibrationSuggestion {
        key,
        bias: mean_residual,
        scale,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_core::{BusId, ElementRef, MeasKind, Measurement, Stream};

    fn residual(value: f64, sigma: f64, bus: usize) -> Residual {
        Residual {
            measurement: Measurement::new(
                Stream::Scada,
                ElementRef::Bus(BusId::new(bus)),
                MeasKind::V,
                1.0,
                sigma,
            ),
            residual: value,
            std_dev: sigma,
        }
    }

    fn estimate_with(residuals: Vec<Residual>, num_states: usize) -> StateEstimate {
        StateEstimate {
            converged: true,
            iterations: 3,
            elapsed_ms: 0.1,
            bus_ids: vec![],
            bus_vm_pu: vec![],
            bus_va_degree: vec![],
            residuals,
            num_states,
        }
    }

    #[test]
    fn clean_residuals_pass_both_tests() {
        let estimate = estimate_with(
            (0..8).map(|i| residual(0.002, 0.01, i)).collect(),
            5,
        );
        let report = detect(&estimate, 0.95);
        assert!(!report.global_suspect);
        assert_eq!(report.degrees_of_freedom, 3);
        assert_eq!(report.suspects().count(), 0);
        assert_eq!(
            report.top_suspect().unwrap().classification,
            Classification::Normal
        );
    }

    #[test]
    fn gross_error_is_ranked_first_and_flagged() {
        let mut residuals: Vec<Residual> = (0..8).map(|i| residual(0.001, 0.01, i)).collect();
        residuals.push(residual(0.1, 0.01, 8)); // 10 sigma
        let estimate = estimate_with(residuals, 5);
        let report = detect(&estimate, 0.95);
        assert!(report.global_suspect);
        let top = report.top_suspect().unwrap();
        assert_eq!(top.key.element, ElementRef::Bus(BusId::new(8)));
        assert_eq!(top.classification, Classification::Suspect);
        assert!((top.normalized - 10.0).abs() < 1e-9);
    }

    #[test]
    fn warning_band_between_two_and_three_sigma() {
        assert_eq!(classify(2.5), Classification::Warning);
        assert_eq!(classify(-2.5), Classification::Warning);
        assert_eq!(classify(1.9), Classification::Normal);
        assert_eq!(classify(3.1), Classification::Suspect);
    }

    #[test]
    fn dof_is_clamped_to_one() {
        let estimate = estimate_with(vec![residual(0.0, 0.01, 0)], 5);
        let report = detect(&estimate, 0.95);
        assert_eq!(report.degrees_of_freedom, 1);
        assert!(report.chi_critical.is_finite());
    }

    #[test]
    fn suggestion_needs_history_and_a_real_offset() {
        let key = Measurement::new(
            Stream::Scada,
            ElementRef::Bus(BusId::new(1)),
            MeasKind::V,
            1.0,
            0.01,
        )
        .key();

        let biased = ResidualSample {
            residual: 0.05,
            std_dev: 0.01,
        };
        assert!(suggest_calibration(key, &[biased; 2]).is_none());

        let clean = ResidualSample {
            residual: 0.001,
            std_dev: 0.01,
        };
        assert!(suggest_calibration(key, &[clean; 5]).is_none());

        let suggestion = suggest_calibration(key, &[biased; 5]).unwrap();
        assert!((suggestion.bias - 0.05).abs() < 1e-12);
        assert!((suggestion.scale - 1.0).abs() < 1e-12);
    }

    #[test]
    fn noisy_channel_gets_a_shrinking_scale() {
        let key = Measurement::new(
            Stream::Scada,
            ElementRef::Bus(BusId::new(2)),
            MeasKind::P,
            10.0,
            0.5,
        )
        .key();
        let samples: Vec<ResidualSample> = [2.0, -1.0, 3.5, 0.5, 4.0]
            .iter()
            .map(|&r| ResidualSample {
                residual: r,
                std_dev: 0.5,
            })
            .collect();
        let suggestion = suggest_calibration(key, &samples).unwrap();
        assert!(suggestion.scale < 1.0);
        assert!(suggestion.scale >= 0.5);
    }
}
