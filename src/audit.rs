//! Leakage verification and the audit record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::calibration::CalibrationReport;
use crate::corpus::{ExclusionStats, Split, SplitSets};
use crate::error::{EngineError, EngineWarning};
use crate::forbidden::FORBIDDEN_KEYWORDS;
use crate::grading::Grade;
use crate::metrics::RiskCoverage;

const SPLIT_PAIRS: [(Split, Split); 3] = [
    (Split::Train, Split::Calibration),
    (Split::Train, Split::Test),
    (Split::Calibration, Split::Test),
];

/// Fail if any race id appears in more than one split.
///
/// The first offending race in (split pair, race id) order is reported.
pub fn verify_disjoint(splits: &SplitSets) -> Result<(), EngineError> {
    for (first, second) in SPLIT_PAIRS {
        if let Some(race_id) = splits.get(first).intersection(splits.get(second)).next() {
            tracing::error!("Race {} appears in both {} and {} splits", race_id, first, second);
            return Err(EngineError::SplitLeakage {
                race_id: race_id.clone(),
                first,
                second,
            });
        }
    }
    tracing::info!(
        "Splits disjoint: train={}, calibration={}, test={}",
        splits.train.len(),
        splits.calibration.len(),
        splits.test.len()
    );
    Ok(())
}

/// Share of races in which two entrants have exactly equal probability.
pub fn tie_rate(races: &[Vec<f64>]) -> f64 {
    if races.is_empty() {
        return 0.0;
    }
    let tied = races
        .iter()
        .filter(|probs| {
            let mut sorted = (*probs).clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            sorted.windows(2).any(|w| w[0] == w[1])
        })
        .count();
    tied as f64 / races.len() as f64
}

/// Grade counts with every grade present, zero or not.
pub fn grade_distribution<'a, I>(grades: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a Grade>,
{
    let mut counts: BTreeMap<String, usize> =
        Grade::ALL.iter().map(|g| (g.to_string(), 0)).collect();
    for grade in grades {
        *counts.entry(grade.to_string()).or_insert(0) += 1;
    }
    counts
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub train: usize,
    pub calibration: usize,
    pub test: usize,
    pub disjoint: bool,
}

impl SplitSummary {
    pub fn from_sets(splits: &SplitSets) -> Self {
        Self {
            train: splits.train.len(),
            calibration: splits.calibration.len(),
            test: splits.test.len(),
            disjoint: verify_disjoint(splits).is_ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub competitors: usize,
    pub alpha: f64,
    pub converged: bool,
    pub iterations: usize,
    pub final_loss: f64,
    pub races_used: usize,
    pub corpus_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceSummary {
    pub races: usize,
    pub converged: usize,
    pub unconverged_races: Vec<String>,
}

/// Everything a reviewer needs to re-check a frozen run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub splits: SplitSummary,
    pub exclusions: ExclusionStats,
    pub exclusion_ratio: f64,
    pub degenerate_races: Vec<String>,
    pub model: ModelSummary,
    pub inference: InferenceSummary,
    pub calibration: Vec<CalibrationReport>,
    pub rcc: RiskCoverage,
    pub tie_rate: f64,
    pub grade_distribution: BTreeMap<String, usize>,
    pub forbidden_keywords: Vec<String>,
    pub warnings: Vec<EngineWarning>,
}

pub fn forbidden_keyword_list() -> Vec<String> {
    FORBIDDEN_KEYWORDS.iter().map(|k| k.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn to_set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn sets(train: &[&str], calibration: &[&str], test: &[&str]) -> SplitSets {
        SplitSets {
            train: to_set(train),
            calibration: to_set(calibration),
            test: to_set(test),
        }
    }

    #[test]
    fn test_disjoint_splits_pass() {
        let s = sets(&["R1", "R2"], &["R3"], &["R4"]);
        assert!(verify_disjoint(&s).is_ok());
        assert!(SplitSummary::from_sets(&s).disjoint);
    }

    #[test]
    fn test_train_test_overlap_is_fatal() {
        let s = sets(&["R1", "R2"], &["R3"], &["R2", "R4"]);
        let err = verify_disjoint(&s).unwrap_err();
        assert_eq!(
            err,
            EngineError::SplitLeakage {
                race_id: "R2".to_string(),
                first: Split::Train,
                second: Split::Test,
            }
        );
        assert!(!SplitSummary::from_sets(&s).disjoint);
    }

    #[test]
    fn test_calibration_test_overlap_detected() {
        let s = sets(&["R1"], &["R5"], &["R5"]);
        assert!(matches!(
            verify_disjoint(&s),
            Err(EngineError::SplitLeakage {
                first: Split::Calibration,
                second: Split::Test,
                ..
            })
        ));
    }

    #[test]
    fn test_tie_rate() {
        let races = vec![vec![0.3, 0.3, 0.1], vec![0.5, 0.2, 0.1], vec![0.4], vec![]];
        assert!((tie_rate(&races) - 0.25).abs() < 1e-12);
        assert_eq!(tie_rate(&[]), 0.0);
    }

    #[test]
    fn test_grade_distribution_lists_all_grades() {
        let dist = grade_distribution(&[Grade::S, Grade::N, Grade::N]);
        assert_eq!(dist.len(), 5);
        assert_eq!(dist["S"], 1);
        assert_eq!(dist["A"], 0);
        assert_eq!(dist["N"], 2);
    }
}
