//! Calibration quality and selective-prediction metrics.

use serde::{Deserialize, Serialize};

/// One equal-width reliability bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub mean_predicted: f64,
    pub observed_rate: f64,
}

/// Expected and maximum calibration error over equal-width bins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationMetrics {
    pub ece: f64,
    pub mce: f64,
    pub samples: usize,
    pub bins: Vec<ReliabilityBin>,
}

/// Compute ECE/MCE for (predicted probability, outcome) pairs.
///
/// ECE weights each bin's |mean predicted - observed rate| by its share of
/// samples; MCE is the largest gap over non-empty bins.
pub fn calibration_error(pairs: &[(f64, bool)], n_bins: usize) -> CalibrationMetrics {
    let n_bins = n_bins.max(1);
    let mut sums = vec![0.0; n_bins];
    let mut hits = vec![0usize; n_bins];
    let mut counts = vec![0usize; n_bins];

    for &(p, outcome) in pairs {
        let p = p.clamp(0.0, 1.0);
        let idx = ((p * n_bins as f64) as usize).min(n_bins - 1);
        sums[idx] += p;
        counts[idx] += 1;
        if outcome {
            hits[idx] += 1;
        }
    }

    let total = pairs.len();
    let mut ece = 0.0;
    let mut mce: f64 = 0.0;
    let mut bins = Vec::with_capacity(n_bins);

    for b in 0..n_bins {
        let (mean_predicted, observed_rate) = if counts[b] > 0 {
            let c = counts[b] as f64;
            (sums[b] / c, hits[b] as f64 / c)
        } else {
            (0.0, 0.0)
        };
        if counts[b] > 0 {
            let gap = (mean_predicted - observed_rate).abs();
            ece += counts[b] as f64 / total as f64 * gap;
            mce = mce.max(gap);
        }
        bins.push(ReliabilityBin {
            lower: b as f64 / n_bins as f64,
            upper: (b + 1) as f64 / n_bins as f64,
            count: counts[b],
            mean_predicted,
            observed_rate,
        });
    }

    CalibrationMetrics {
        ece,
        mce,
        samples: total,
        bins,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RccPoint {
    pub coverage: f64,
    pub risk: f64,
}

/// Risk-coverage curve summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCoverage {
    /// Area under the curve; lower is better
    pub auc: f64,
    pub samples: usize,
    pub points: Vec<RccPoint>,
}

/// Build the risk-coverage curve from (confidence, correct) pairs.
///
/// Predictions are accepted in order of decreasing confidence, sweeping the
/// threshold so tied confidences enter together; risk at each threshold is
/// the error rate among everything accepted so far. The curve starts at
/// coverage 0 with the risk of the first threshold and the area is
/// integrated with the trapezoid rule. `n_points` evenly spaced coverages are
/// kept for reporting, each taking the first threshold that reaches it.
pub fn risk_coverage(pairs: &[(f64, bool)], n_points: usize) -> RiskCoverage {
    let n = pairs.len();
    if n == 0 {
        return RiskCoverage {
            auc: 0.0,
            samples: 0,
            points: Vec::new(),
        };
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| pairs[b].0.total_cmp(&pairs[a].0));

    // covered[k] predictions accepted at curve[k]
    let mut curve = Vec::new();
    let mut covered = Vec::new();
    let mut errors = 0usize;
    let mut start = 0;
    while start < n {
        let confidence = pairs[order[start]].0;
        let mut end = start;
        while end < n && pairs[order[end]].0.total_cmp(&confidence).is_eq() {
            if !pairs[order[end]].1 {
                errors += 1;
            }
            end += 1;
        }
        curve.push(RccPoint {
            coverage: end as f64 / n as f64,
            risk: errors as f64 / end as f64,
        });
        covered.push(end);
        start = end;
    }
    curve.insert(
        0,
        RccPoint {
            coverage: 0.0,
            risk: curve[0].risk,
        },
    );
    covered.insert(0, 0);

    let auc = curve
        .windows(2)
        .map(|w| (w[1].coverage - w[0].coverage) * (w[0].risk + w[1].risk) / 2.0)
        .sum();

    let n_points = n_points.max(2);
    let points = (0..n_points)
        .map(|j| {
            let target = j * n / (n_points - 1);
            let at = covered.partition_point(|&c| c < target);
            curve[at.min(curve.len() - 1)]
        })
        .collect();

    RiskCoverage {
        auc,
        samples: n,
        points,
    }
}
