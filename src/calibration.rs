//! Isotonic probability calibration.
//!
//! Calibration maps raw model probabilities onto observed frequencies with a
//! non-decreasing step function fit by pool-adjacent-violators (PAV). The fit
//! is stored as an interpolation table so the frozen artifact is portable.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::CalibrationConfig;
use crate::error::{EngineError, EngineWarning};
use crate::metrics::{calibration_error, CalibrationMetrics};

/// Monotone map from raw probability to calibrated probability.
///
/// Linear interpolation between knots; inputs outside the fitted range are
/// clipped to the end values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotonicMap {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

struct Block {
    weight: f64,
    sum: f64,
    first: usize,
    last: usize,
}

impl Block {
    fn mean(&self) -> f64 {
        self.sum / self.weight
    }
}

impl IsotonicMap {
    /// Fit on (raw probability, outcome) pairs.
    pub fn fit(pairs: &[(f64, bool)]) -> Result<Self, EngineError> {
        if pairs.is_empty() {
            return Err(EngineError::InvalidCalibration(
                "no calibration pairs".to_string(),
            ));
        }
        if let Some((p, _)) = pairs.iter().find(|(p, _)| !p.is_finite()) {
            return Err(EngineError::InvalidCalibration(format!(
                "non-finite raw probability {}",
                p
            )));
        }

        let mut sorted: Vec<(f64, f64)> = pairs
            .iter()
            .map(|&(p, hit)| (p, if hit { 1.0 } else { 0.0 }))
            .collect();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

        // Collapse equal inputs first so ties share one fitted value.
        let mut xs: Vec<f64> = Vec::new();
        let mut blocks: Vec<Block> = Vec::new();
        for (x, y) in sorted {
            if xs.last() == Some(&x) {
                if let Some(block) = blocks.last_mut() {
                    block.weight += 1.0;
                    block.sum += y;
                }
                continue;
            }
            let i = xs.len();
            xs.push(x);
            blocks.push(Block {
                weight: 1.0,
                sum: y,
                first: i,
                last: i,
            });
        }

        let mut stack: Vec<Block> = Vec::with_capacity(blocks.len());
        for block in blocks {
            stack.push(block);
            while stack.len() > 1 && stack[stack.len() - 2].mean() > stack[stack.len() - 1].mean() {
                if let Some(merged) = stack.pop() {
                    if let Some(prev) = stack.last_mut() {
                        prev.weight += merged.weight;
                        prev.sum += merged.sum;
                        prev.last = merged.last;
                    }
                }
            }
        }

        // Keep both ends of every flat segment as knots.
        let mut x = Vec::new();
        let mut y = Vec::new();
        for block in &stack {
            let value = block.mean();
            x.push(xs[block.first]);
            y.push(value);
            if block.last != block.first {
                x.push(xs[block.last]);
                y.push(value);
            }
        }

        Ok(Self { x, y })
    }

    /// Structural check for a map read from disk: equal non-empty knot
    /// vectors, non-decreasing in both coordinates, outputs in [0, 1].
    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: String| Err(EngineError::InvalidCalibration(reason));
        if self.x.is_empty() || self.x.len() != self.y.len() {
            return invalid(format!(
                "knot vectors must be non-empty and equal length (x={}, y={})",
                self.x.len(),
                self.y.len()
            ));
        }
        if self.x.iter().chain(&self.y).any(|v| !v.is_finite()) {
            return invalid("non-finite knot".to_string());
        }
        if self.x.windows(2).any(|w| w[0] > w[1]) {
            return invalid("knot inputs are not sorted".to_string());
        }
        if self.y.windows(2).any(|w| w[0] > w[1]) {
            return invalid("map is decreasing".to_string());
        }
        if self.y.iter().any(|v| !(0.0..=1.0).contains(v)) {
            return invalid("map output outside [0, 1]".to_string());
        }
        Ok(())
    }

    pub fn apply(&self, p: f64) -> f64 {
        let (Some(&x0), Some(&x1)) = (self.x.first(), self.x.last()) else {
            return p;
        };
        if p.is_nan() || p <= x0 {
            return self.y[0];
        }
        if p >= x1 {
            return self.y[self.y.len() - 1];
        }

        let hi = self.x.partition_point(|&k| k < p);
        if self.x[hi] == p {
            return self.y[hi];
        }
        let lo = hi - 1;
        let t = (p - self.x[lo]) / (self.x[hi] - self.x[lo]);
        self.y[lo] + t * (self.y[hi] - self.y[lo])
    }
}

/// Win and place maps fit on the calibration split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsotonicCalibration {
    pub win: IsotonicMap,
    pub place: IsotonicMap,
    /// Positions counted as a place when the maps were fit
    pub place_positions: usize,
    pub fitted_races: usize,
    pub fitted_entries: usize,
}

impl IsotonicCalibration {
    pub fn fit(
        win_pairs: &[(f64, bool)],
        place_pairs: &[(f64, bool)],
        place_positions: usize,
        fitted_races: usize,
    ) -> Result<Self, EngineError> {
        let calibration = Self {
            win: IsotonicMap::fit(win_pairs)?,
            place: IsotonicMap::fit(place_pairs)?,
            place_positions,
            fitted_races,
            fitted_entries: win_pairs.len(),
        };
        tracing::info!(
            "Fitted isotonic calibration on {} races ({} entries, {} win knots, {} place knots)",
            fitted_races,
            calibration.fitted_entries,
            calibration.win.x.len(),
            calibration.place.x.len()
        );
        Ok(calibration)
    }
}

/// Calibrator enum for runtime selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Calibrator {
    Isotonic(IsotonicCalibration),
    None,
}

impl Default for Calibrator {
    fn default() -> Self {
        Calibrator::None
    }
}

impl Calibrator {
    pub fn calibrate_place(&self, prob: f64) -> f64 {
        match self {
            Calibrator::Isotonic(c) => c.place.apply(prob).clamp(0.0, 1.0),
            Calibrator::None => prob,
        }
    }

    /// Calibrate one race.
    ///
    /// Win outputs are renormalized within the race; if the map sends every
    /// entrant to zero the raw distribution is kept.
    pub fn calibrate_race(&self, win_raw: &[f64], place_raw: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let Calibrator::Isotonic(c) = self else {
            return (win_raw.to_vec(), place_raw.to_vec());
        };

        let mapped: Vec<f64> = win_raw.iter().map(|&p| c.win.apply(p).max(0.0)).collect();
        let total: f64 = mapped.iter().sum();
        let win = if total > 0.0 && total.is_finite() {
            mapped.into_iter().map(|p| p / total).collect()
        } else {
            win_raw.to_vec()
        };
        let place = place_raw.iter().map(|&p| self.calibrate_place(p)).collect();
        (win, place)
    }

    /// Validate every map of a loaded calibrator.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            Calibrator::Isotonic(c) => {
                c.win.validate()?;
                c.place.validate()
            }
            Calibrator::None => Ok(()),
        }
    }

    /// Check if calibration is enabled.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Calibrator::None)
    }

    /// Load calibrator from JSON file.
    ///
    /// ```json
    /// {"type": "isotonic", "win": {"x": [...], "y": [...]}, "place": {...}, ...}
    /// ```
    /// or `{"type": "none"}`.
    /// A calibration artifact with held-out reports loads the same way.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        let artifact: CalibrationArtifact = serde_json::from_str(&content)?;
        artifact.calibrator.validate()?;
        Ok(artifact.calibrator)
    }
}

/// On-disk calibration: the fitted maps and their before/after scores on
/// the test split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationArtifact {
    #[serde(flatten)]
    pub calibrator: Calibrator,
    #[serde(default)]
    pub reports: Vec<CalibrationReport>,
}

/// Before/after calibration quality on held-out pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub target: String,
    pub before: CalibrationMetrics,
    pub after: CalibrationMetrics,
    pub suspect: bool,
}

/// Score raw and calibrated pairs for one target.
///
/// An after-ECE below the configured threshold is implausible for real
/// held-out races and raises `CalibrationSuspect`.
pub fn evaluate(
    target: &str,
    raw: &[(f64, bool)],
    calibrated: &[(f64, bool)],
    config: &CalibrationConfig,
) -> (CalibrationReport, Option<EngineWarning>) {
    let before = calibration_error(raw, config.n_bins);
    let after = calibration_error(calibrated, config.n_bins);
    let suspect = after.samples > 0 && after.ece < config.suspect_ece_threshold;

    tracing::info!(
        "{} calibration: ECE {:.4} -> {:.4}, MCE {:.4} -> {:.4}",
        target,
        before.ece,
        after.ece,
        before.mce,
        after.mce
    );

    let warning = if suspect {
        let w = EngineWarning::CalibrationSuspect {
            target: target.to_string(),
            ece_after: after.ece,
            threshold: config.suspect_ece_threshold,
        };
        tracing::warn!("{}", w);
        Some(w)
    } else {
        None
    };

    (
        CalibrationReport {
            target: target.to_string(),
            before,
            after,
            suspect,
        },
        warning,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(data: &[(f64, u8)]) -> Vec<(f64, bool)> {
        data.iter().map(|&(p, y)| (p, y == 1)).collect()
    }

    #[test]
    fn test_pav_pools_violations() {
        let map = IsotonicMap::fit(&pairs(&[(0.1, 0), (0.2, 1), (0.3, 0), (0.4, 1)])).unwrap();
        // 0.2 and 0.3 pool to 0.5
        assert_eq!(map.apply(0.1), 0.0);
        assert!((map.apply(0.2) - 0.5).abs() < 1e-12);
        assert!((map.apply(0.3) - 0.5).abs() < 1e-12);
        assert_eq!(map.apply(0.4), 1.0);
        assert!((map.apply(0.35) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_map_is_monotone_and_bounded() {
        let data: Vec<(f64, bool)> = (0..200)
            .map(|i| {
                let p = (i as f64 * 0.618).fract();
                (p, (i * 7919) % 10 < (p * 10.0) as usize)
            })
            .collect();
        let map = IsotonicMap::fit(&data).unwrap();

        let mut prev = f64::NEG_INFINITY;
        for i in 0..=1000 {
            let v = map.apply(i as f64 / 1000.0);
            assert!(v >= prev);
            assert!((0.0..=1.0).contains(&v));
            prev = v;
        }
    }

    #[test]
    fn test_clips_outside_fitted_range() {
        let map = IsotonicMap::fit(&pairs(&[(0.2, 0), (0.6, 1)])).unwrap();
        assert_eq!(map.apply(0.0), 0.0);
        assert_eq!(map.apply(1.0), 1.0);
        assert_eq!(map.apply(f64::NAN), 0.0);
    }

    #[test]
    fn test_tied_inputs_share_a_value() {
        let map = IsotonicMap::fit(&pairs(&[(0.3, 1), (0.3, 0), (0.3, 0), (0.3, 1)])).unwrap();
        assert_eq!(map.x, vec![0.3]);
        assert_eq!(map.apply(0.3), 0.5);
    }

    #[test]
    fn test_empty_pairs_rejected() {
        assert!(matches!(
            IsotonicMap::fit(&[]),
            Err(EngineError::InvalidCalibration(_))
        ));
        assert!(IsotonicMap::fit(&[(f64::NAN, true)]).is_err());
    }

    #[test]
    fn test_calibrated_win_renormalized() {
        let win = pairs(&[(0.1, 0), (0.2, 0), (0.5, 1), (0.6, 1), (0.3, 0)]);
        let place = pairs(&[(0.3, 0), (0.5, 1), (0.8, 1)]);
        let cal = Calibrator::Isotonic(IsotonicCalibration::fit(&win, &place, 3, 2).unwrap());

        let (w, p) = cal.calibrate_race(&[0.5, 0.3, 0.2], &[0.9, 0.6, 0.4]);
        assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p.iter().all(|v| (0.0..=1.0).contains(v)));
        assert!(p[0] >= p[1] && p[1] >= p[2]);
    }

    #[test]
    fn test_uncalibrated_is_identity() {
        let (w, p) = Calibrator::None.calibrate_race(&[0.7, 0.3], &[1.0, 1.0]);
        assert_eq!(w, vec![0.7, 0.3]);
        assert_eq!(p, vec![1.0, 1.0]);
        assert!(!Calibrator::None.is_enabled());
    }

    #[test]
    fn test_suspect_warning_on_near_zero_ece() {
        let cfg = CalibrationConfig::default();
        let raw = pairs(&[(0.9, 0), (0.8, 0), (0.1, 1), (0.2, 1)]);
        let perfect = pairs(&[(0.0, 0), (0.0, 0), (1.0, 1), (1.0, 1)]);
        let (report, warning) = evaluate("place", &raw, &perfect, &cfg);

        assert!(report.suspect);
        assert!(report.before.ece > report.after.ece);
        assert!(matches!(warning, Some(EngineWarning::CalibrationSuspect { .. })));

        let (report, warning) = evaluate("place", &raw, &raw, &cfg);
        assert!(!report.suspect);
        assert!(warning.is_none());
    }

    fn write_calibrator(json: &str) -> tempfile::NamedTempFile {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_mismatched_knots_rejected_on_load() {
        let file = write_calibrator(
            r#"{"type": "isotonic", "win": {"x": [0.1, 0.5], "y": [0.2]},
                "place": {"x": [0.1], "y": [0.2]},
                "place_positions": 3, "fitted_races": 1, "fitted_entries": 2}"#,
        );
        let err = Calibrator::from_file(file.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::InvalidCalibration(_))
        ));
    }

    #[test]
    fn test_decreasing_map_rejected_on_load() {
        let file = write_calibrator(
            r#"{"type": "isotonic", "win": {"x": [0.1, 0.5], "y": [0.1, 0.4]},
                "place": {"x": [0.1, 0.5], "y": [0.9, 0.1]},
                "place_positions": 3, "fitted_races": 1, "fitted_entries": 2}"#,
        );
        assert!(Calibrator::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_bounds_and_order() {
        let map = |x: Vec<f64>, y: Vec<f64>| IsotonicMap { x, y };
        assert!(map(vec![0.1, 0.5], vec![0.2, 0.7]).validate().is_ok());
        assert!(map(vec![], vec![]).validate().is_err());
        assert!(map(vec![0.5, 0.1], vec![0.2, 0.7]).validate().is_err());
        assert!(map(vec![0.1, 0.5], vec![0.2, 1.5]).validate().is_err());
        assert!(map(vec![0.1, 0.5], vec![f64::NAN, 0.5]).validate().is_err());
    }

    #[test]
    fn test_artifact_with_reports_loads_as_calibrator() {
        let map = IsotonicMap::fit(&pairs(&[(0.2, 0), (0.6, 1)])).unwrap();
        let (report, _) = evaluate(
            "place",
            &pairs(&[(0.2, 0), (0.6, 1)]),
            &pairs(&[(0.1, 0), (0.7, 1)]),
            &CalibrationConfig::default(),
        );
        let artifact = CalibrationArtifact {
            calibrator: Calibrator::Isotonic(IsotonicCalibration {
                win: map.clone(),
                place: map,
                place_positions: 3,
                fitted_races: 1,
                fitted_entries: 2,
            }),
            reports: vec![report],
        };
        let json = serde_json::to_string(&artifact).unwrap();
        assert!(json.contains(r#""type":"isotonic""#));
        assert!(json.contains(r#""reports""#));

        let file = write_calibrator(&json);
        assert_eq!(Calibrator::from_file(file.path()).unwrap(), artifact.calibrator);
        let back: CalibrationArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.reports.len(), 1);
    }

    #[test]
    fn test_calibrator_json_roundtrip_tag() {
        let json = r#"{"type": "none"}"#;
        let calibrator: Calibrator = serde_json::from_str(json).unwrap();
        assert!(!calibrator.is_enabled());

        let map = IsotonicMap::fit(&pairs(&[(0.2, 0), (0.6, 1)])).unwrap();
        let cal = Calibrator::Isotonic(IsotonicCalibration {
            win: map.clone(),
            place: map,
            place_positions: 3,
            fitted_races: 1,
            fitted_entries: 2,
        });
        let json = serde_json::to_string(&cal).unwrap();
        assert!(json.contains(r#""type":"isotonic""#));
    }
}
