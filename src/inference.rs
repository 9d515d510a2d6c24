//! Power EP rank-probability inference for a single race.
//!
//! The joint Plackett-Luce ranking is approximated by a position x entrant
//! marginal matrix `Q`, where `Q[r][i]` is the probability that entrant `i`
//! finishes in position `r`. Each position row is a site. Its target gives
//! entrant `i` its expected share of position `r`:
//!
//! ```text
//! T_i(r) = R_i(r) * E[w_i / (w_i + sum_{j != i} w_j U_j)],   R_i(r) = max(0, 1 - sum_{t<r} Q_i(t))
//! ```
//!
//! where `U_j` marks entrant `j` as still unplaced given that `i` is. The
//! expectation is expanded to second order around the mean remaining strength.
//!
//! Updates are damped by the fractional power `alpha` in log space,
//! `log Q' = (1 - alpha) log Q + alpha log T`, followed by row normalization.
//! Each row is then capped so no entrant's total over positions exceeds 1.
//! Row 0 has every entrant unplaced and converges to the exact softmax win
//! distribution.

use crate::config::InferenceConfig;
use crate::error::{EngineError, EngineWarning, Stage};

const LOG_FLOOR: f64 = 1e-12;
const EQUAL_SKILL_EPS: f64 = 1e-12;

/// Loop state of the Power EP procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpPhase {
    Initializing,
    Iterating { iteration: usize },
    Converged { iterations: usize },
    BudgetExhausted { iterations: usize },
}

impl EpPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EpPhase::Converged { .. } | EpPhase::BudgetExhausted { .. })
    }
}

/// Normalized, max-shifted strengths `exp(s_i - max s)`.
pub fn strengths(skills: &[f64]) -> Vec<f64> {
    let max = skills.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    skills.iter().map(|s| (s - max).exp()).collect()
}

/// Exact Plackett-Luce first-place distribution.
pub fn softmax(skills: &[f64]) -> Vec<f64> {
    let w = strengths(skills);
    let total: f64 = w.iter().sum();
    w.into_iter().map(|x| x / total).collect()
}

fn uniform_matrix(n: usize) -> Vec<Vec<f64>> {
    vec![vec![1.0 / n as f64; n]; n]
}

/// Expected share of position `r` for entrant `i`, before normalization.
///
/// `placed` holds each entrant's mass over the positions before `r`.
fn site_target(i: usize, r: usize, weights: &[f64], placed: &[f64]) -> f64 {
    let remaining = (1.0 - placed[i]).max(0.0);
    let w_i = weights[i];
    if remaining <= 0.0 || w_i <= 0.0 {
        return 0.0;
    }

    // The r filled positions all went to someone other than i.
    let others_placed = r as f64 - placed[i];
    let scale = if others_placed > EQUAL_SKILL_EPS {
        r as f64 / others_placed
    } else {
        0.0
    };

    let mut mean = w_i;
    let mut variance = 0.0;
    for (j, (&w_j, &p_j)) in weights.iter().zip(placed).enumerate() {
        if j == i {
            continue;
        }
        let unplaced = (1.0 - (p_j * scale).min(1.0)).max(0.0);
        mean += w_j * unplaced;
        variance += w_j * w_j * unplaced * (1.0 - unplaced);
    }

    let inverse = (1.0 / mean + variance / mean.powi(3)).min(1.0 / w_i);
    remaining * w_i * inverse
}

/// Clip a normalized row to each entrant's remaining capacity and hand the
/// excess to the unclipped entrants in proportion.
fn cap_row(row: &mut [f64], capacity: &[f64]) {
    let n = row.len();
    let mut fixed = vec![false; n];
    for _ in 0..n {
        let mut clipped = false;
        for i in 0..n {
            if !fixed[i] && row[i] > capacity[i] {
                row[i] = capacity[i];
                fixed[i] = true;
                clipped = true;
            }
        }
        if !clipped {
            break;
        }

        let fixed_mass: f64 = (0..n).filter(|&i| fixed[i]).map(|i| row[i]).sum();
        let free_mass: f64 = (0..n).filter(|&i| !fixed[i]).map(|i| row[i]).sum();
        if free_mass <= 0.0 {
            break;
        }
        let factor = (1.0 - fixed_mass) / free_mass;
        for i in (0..n).filter(|&i| !fixed[i]) {
            row[i] *= factor;
        }
    }
}

/// One damped update of every site.
///
/// Pure: returns the new marginal matrix and the largest absolute change.
pub fn ep_update(q: &[Vec<f64>], weights: &[f64], alpha: f64) -> (Vec<Vec<f64>>, f64) {
    let n = weights.len();
    let mut next: Vec<Vec<f64>> = Vec::with_capacity(q.len());
    let mut placed = vec![0.0f64; n];
    let mut placed_next = vec![0.0f64; n];
    let mut delta: f64 = 0.0;

    for (r, row) in q.iter().enumerate() {
        let targets: Vec<f64> = (0..n).map(|i| site_target(i, r, weights, &placed)).collect();
        let mass: f64 = targets.iter().sum();

        let new_row = if mass > 0.0 && mass.is_finite() {
            let logs: Vec<f64> = row
                .iter()
                .zip(&targets)
                .map(|(&current, &t)| {
                    let target = (t / mass).max(LOG_FLOOR);
                    (1.0 - alpha) * current.max(LOG_FLOOR).ln() + alpha * target.ln()
                })
                .collect();
            let mut normalized = normalize_log(&logs);
            let capacity: Vec<f64> = placed_next.iter().map(|p| (1.0 - p).max(0.0)).collect();
            cap_row(&mut normalized, &capacity);
            normalized
        } else {
            // Nothing left to place; hold the row.
            row.clone()
        };

        for i in 0..n {
            delta = delta.max((new_row[i] - row[i]).abs());
            placed[i] += row[i];
            placed_next[i] += new_row[i];
        }
        next.push(new_row);
    }

    (next, delta)
}

fn normalize_log(logs: &[f64]) -> Vec<f64> {
    let max = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logs.iter().map(|l| (l - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Explicit Power EP state machine.
#[derive(Debug, Clone)]
pub struct PowerEp {
    weights: Vec<f64>,
    q: Vec<Vec<f64>>,
    alpha: f64,
    tolerance: f64,
    max_iterations: usize,
    phase: EpPhase,
    last_delta: f64,
}

impl PowerEp {
    pub fn new(skills: &[f64], config: &InferenceConfig) -> Self {
        Self {
            weights: strengths(skills),
            q: Vec::new(),
            alpha: config.alpha,
            tolerance: config.tolerance,
            max_iterations: config.max_iterations,
            phase: EpPhase::Initializing,
            last_delta: f64::INFINITY,
        }
    }

    pub fn phase(&self) -> EpPhase {
        self.phase
    }

    pub fn marginals(&self) -> &[Vec<f64>] {
        &self.q
    }

    pub fn last_delta(&self) -> f64 {
        self.last_delta
    }

    /// Advance by one transition. Terminal phases are absorbing.
    pub fn step(&mut self) -> EpPhase {
        self.phase = match self.phase {
            EpPhase::Initializing => {
                self.q = uniform_matrix(self.weights.len());
                EpPhase::Iterating { iteration: 0 }
            }
            EpPhase::Iterating { iteration } if iteration >= self.max_iterations => {
                EpPhase::BudgetExhausted { iterations: iteration }
            }
            EpPhase::Iterating { iteration } => {
                let (q, delta) = ep_update(&self.q, &self.weights, self.alpha);
                self.q = q;
                self.last_delta = delta;
                if delta < self.tolerance {
                    EpPhase::Converged {
                        iterations: iteration + 1,
                    }
                } else {
                    EpPhase::Iterating {
                        iteration: iteration + 1,
                    }
                }
            }
            terminal => terminal,
        };
        self.phase
    }

    pub fn run(mut self) -> (Vec<Vec<f64>>, EpPhase) {
        while !self.step().is_terminal() {}
        tracing::debug!("Power EP finished in {:?} (delta={:.3e})", self.phase, self.last_delta);
        (self.q, self.phase)
    }
}

/// Win and place probabilities for one race, aligned with the input skills.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceProbabilities {
    pub win: Vec<f64>,
    pub place: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
    pub warning: Option<EngineWarning>,
}

fn certain_or_uniform(n: usize, place_positions: usize) -> RaceProbabilities {
    let share = place_positions.min(n) as f64 / n as f64;
    RaceProbabilities {
        win: vec![1.0 / n as f64; n],
        place: vec![share.min(1.0); n],
        converged: true,
        iterations: 0,
        warning: None,
    }
}

fn is_valid(values: &[f64]) -> bool {
    values.iter().all(|v| v.is_finite() && *v >= 0.0)
}

/// Infer win and top-k place probabilities for one race.
///
/// A single entrant or an all-equal field short-circuits to the exact
/// certain/uniform answer. Running out of iterations yields the last
/// iterate with a `NonConvergence` warning.
pub fn infer_race(
    race_id: &str,
    skills: &[f64],
    config: &InferenceConfig,
) -> Result<RaceProbabilities, EngineError> {
    let n = skills.len();
    if n == 0 {
        return Err(EngineError::InvalidRace {
            race_id: race_id.to_string(),
            reason: "no entrants".to_string(),
        });
    }
    if skills.iter().any(|s| !s.is_finite()) {
        return Err(EngineError::InvalidRace {
            race_id: race_id.to_string(),
            reason: "non-finite skill".to_string(),
        });
    }

    let k = config.place_positions;
    let first = skills[0];
    if n == 1 || skills.iter().all(|s| (s - first).abs() <= EQUAL_SKILL_EPS) {
        return Ok(certain_or_uniform(n, k));
    }

    let (q, phase) = PowerEp::new(skills, config).run();
    let (converged, iterations) = match phase {
        EpPhase::Converged { iterations } => (true, iterations),
        EpPhase::BudgetExhausted { iterations } => (false, iterations),
        EpPhase::Initializing | EpPhase::Iterating { .. } => (false, 0),
    };

    let row_total: f64 = q[0].iter().sum();
    let mut win: Vec<f64> = q[0].iter().map(|p| p / row_total).collect();

    let mut place: Vec<f64> = if n <= k {
        vec![1.0; n]
    } else {
        (0..n)
            .map(|i| q.iter().take(k).map(|row| row[i]).sum::<f64>().clamp(0.0, 1.0))
            .collect()
    };

    if !is_valid(&win) || !is_valid(&place) {
        tracing::warn!("Race {}: invalid marginals, falling back to softmax", race_id);
        win = softmax(skills);
        place = win.iter().map(|p| (p * k as f64).min(1.0)).collect();
    }

    let warning = if converged {
        None
    } else {
        tracing::warn!(
            "Race {}: Power EP exhausted {} iterations without converging",
            race_id,
            iterations
        );
        Some(EngineWarning::NonConvergence {
            stage: Stage::Inference,
            scope: race_id.to_string(),
            iterations,
        })
    };

    Ok(RaceProbabilities {
        win,
        place,
        converged,
        iterations,
        warning,
    })
}
