//! Coverage-fixed grading.
//!
//! Entrants are ranked by calibrated place probability and cut into five
//! bands at fixed cumulative population shares. With the default thresholds
//! that is S = top 10%, A = next 15%, B = next 25%, C = next 30%, N = rest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::GradingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Grade {
    S,
    A,
    B,
    C,
    N,
}

impl Grade {
    pub const ALL: [Grade; 5] = [Grade::S, Grade::A, Grade::B, Grade::C, Grade::N];

    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::S => "S",
            Grade::A => "A",
            Grade::B => "B",
            Grade::C => "C",
            Grade::N => "N",
        }
    }

    pub fn parse(s: &str) -> Option<Grade> {
        Grade::ALL.iter().copied().find(|g| g.as_str() == s.trim())
    }
}

impl fmt::Display for Grade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entrant as seen by the grader.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeInput {
    pub program_number: u32,
    pub place_cal: f64,
}

/// Grades for one race, aligned with the input slice.
#[derive(Debug, Clone, PartialEq)]
pub struct GradeAssignment {
    pub grades: Vec<Grade>,
    /// 1-based rank after the probability/program-number sort
    pub ranks: Vec<usize>,
    pub hash: String,
}

/// Cumulative position boundaries for a field of `n`.
///
/// Boundary k is `ceil(n * p_k / 100)`, so the first rank always lands in S
/// and small fields never get an empty top band.
pub fn boundaries(n: usize, config: &GradingConfig) -> [usize; 4] {
    let mut out = [0usize; 4];
    for (slot, &pct) in out.iter_mut().zip(config.cumulative_percent.iter()) {
        *slot = (n * pct as usize + 99) / 100;
    }
    out
}

fn grade_at(index: usize, bounds: &[usize; 4]) -> Grade {
    bounds
        .iter()
        .position(|&b| index < b)
        .map(|k| Grade::ALL[k])
        .unwrap_or(Grade::N)
}

/// Rank and grade a race.
///
/// Ties in probability are broken by ascending program number, so the
/// assignment is a pure function of its input.
pub fn assign_grades(entrants: &[GradeInput], config: &GradingConfig) -> GradeAssignment {
    let n = entrants.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        entrants[b]
            .place_cal
            .total_cmp(&entrants[a].place_cal)
            .then_with(|| entrants[a].program_number.cmp(&entrants[b].program_number))
    });

    let bounds = boundaries(n, config);
    let mut grades = vec![Grade::N; n];
    let mut ranks = vec![0usize; n];
    let mut hasher = Sha256::new();

    for (rank_index, &i) in order.iter().enumerate() {
        let grade = grade_at(rank_index, &bounds);
        grades[i] = grade;
        ranks[i] = rank_index + 1;
        hasher.update(format!("{}:{}:{}\n", rank_index + 1, entrants[i].program_number, grade).as_bytes());
    }

    GradeAssignment {
        grades,
        ranks,
        hash: format!("sha256:{:x}", hasher.finalize()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(probs: &[f64]) -> Vec<GradeInput> {
        probs
            .iter()
            .enumerate()
            .map(|(i, &p)| GradeInput {
                program_number: i as u32 + 1,
                place_cal: p,
            })
            .collect()
    }

    fn count(assignment: &GradeAssignment, grade: Grade) -> usize {
        assignment.grades.iter().filter(|&&g| g == grade).count()
    }

    #[test]
    fn test_twenty_entrant_bands() {
        let probs: Vec<f64> = (0..20).map(|i| 0.95 - i as f64 * 0.04).collect();
        let a = assign_grades(&inputs(&probs), &GradingConfig::default());

        assert_eq!(count(&a, Grade::S), 2);
        assert_eq!(count(&a, Grade::A), 3);
        assert_eq!(count(&a, Grade::B), 5);
        assert_eq!(count(&a, Grade::C), 6);
        assert_eq!(count(&a, Grade::N), 4);
        // Highest probability is program 1
        assert_eq!(a.grades[0], Grade::S);
        assert_eq!(a.ranks[0], 1);
        assert_eq!(a.grades[19], Grade::N);
    }

    #[test]
    fn test_tie_broken_by_program_number() {
        let entrants = vec![
            GradeInput { program_number: 7, place_cal: 0.30 },
            GradeInput { program_number: 3, place_cal: 0.30 },
            GradeInput { program_number: 1, place_cal: 0.10 },
        ];
        let a = assign_grades(&entrants, &GradingConfig::default());
        assert_eq!(a.ranks, vec![2, 1, 3]);

        let reversed: Vec<GradeInput> = entrants.iter().rev().copied().collect();
        let b = assign_grades(&reversed, &GradingConfig::default());
        assert_eq!(b.ranks, vec![3, 1, 2]);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_small_fields() {
        let cfg = GradingConfig::default();
        assert_eq!(assign_grades(&inputs(&[0.5]), &cfg).grades, vec![Grade::S]);
        assert_eq!(
            assign_grades(&inputs(&[0.6, 0.4]), &cfg).grades,
            vec![Grade::S, Grade::C]
        );
        assert_eq!(
            assign_grades(&inputs(&[0.9, 0.7, 0.5, 0.3, 0.1]), &cfg).grades,
            vec![Grade::S, Grade::A, Grade::B, Grade::C, Grade::N]
        );
        assert!(assign_grades(&[], &cfg).grades.is_empty());
    }

    #[test]
    fn test_boundaries_use_integer_ceiling() {
        let cfg = GradingConfig::default();
        assert_eq!(boundaries(20, &cfg), [2, 5, 10, 16]);
        assert_eq!(boundaries(10, &cfg), [1, 3, 5, 8]);
        assert_eq!(boundaries(18, &cfg), [2, 5, 9, 15]);
    }

    #[test]
    fn test_assignment_is_reproducible() {
        let probs = [0.41, 0.12, 0.33, 0.33, 0.08, 0.27];
        let a = assign_grades(&inputs(&probs), &GradingConfig::default());
        let b = assign_grades(&inputs(&probs), &GradingConfig::default());
        assert_eq!(a, b);
        assert!(a.hash.starts_with("sha256:"));
    }

    #[test]
    fn test_grade_serializes_as_letter() {
        assert_eq!(serde_json::to_string(&Grade::S).unwrap(), "\"S\"");
        assert_eq!(Grade::N.to_string(), "N");
        assert_eq!(Grade::parse("B"), Some(Grade::B));
        assert_eq!(Grade::parse("X"), None);
    }
}
