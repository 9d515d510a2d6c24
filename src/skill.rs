//! Listwise maximum-likelihood (ListMLE) skill estimation under the
//! Plackett-Luce model.
//!
//! The probability of an observed order is the product, from first place to
//! last, of `exp(s_i) / sum(exp(s_j))` over competitors not yet placed. Skills
//! are fit by preconditioned gradient ascent on the mean per-race
//! log-likelihood with a ridge penalty. Accumulation runs race by race in
//! race-id order, so results are bit-reproducible.

use std::collections::BTreeMap;

use crate::config::TrainingConfig;
use crate::corpus::{HistoricalRace, TrainingOrder};
use crate::error::{EngineError, EngineWarning, Stage};
use crate::types::CompetitorId;

/// Result of a batch fit.
#[derive(Debug, Clone)]
pub struct SkillFit {
    /// Mean-centered skills
    pub skills: BTreeMap<CompetitorId, f64>,
    pub converged: bool,
    pub iterations: usize,
    /// Penalized mean negative log-likelihood per race at the returned skills
    pub final_loss: f64,
    pub races_used: usize,
    pub degenerate_races: Vec<String>,
    pub loss_history: Vec<f64>,
    pub warnings: Vec<EngineWarning>,
}

/// Log-probability of an order under Plackett-Luce.
///
/// `skills` are listed in finishing order, winner first.
pub fn plackett_luce_log_prob(skills: &[f64]) -> f64 {
    let mut log_prob = 0.0;
    for i in 0..skills.len().saturating_sub(1) {
        log_prob += skills[i] - log_sum_exp(&skills[i..]);
    }
    log_prob
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Negative log-likelihood summed over orders and its gradient
/// (of the log-likelihood) with respect to each skill.
fn nll_and_gradient(orders: &[Vec<usize>], theta: &[f64]) -> (f64, Vec<f64>) {
    let mut nll = 0.0;
    let mut grad = vec![0.0; theta.len()];
    let mut exps: Vec<f64> = Vec::new();

    for order in orders {
        for stage in 0..order.len() - 1 {
            let remaining = &order[stage..];
            let max = remaining
                .iter()
                .map(|&j| theta[j])
                .fold(f64::NEG_INFINITY, f64::max);

            exps.clear();
            exps.extend(remaining.iter().map(|&j| (theta[j] - max).exp()));
            let denom: f64 = exps.iter().sum();

            let chosen = order[stage];
            nll += max + denom.ln() - theta[chosen];
            grad[chosen] += 1.0;
            for (&j, &e) in remaining.iter().zip(exps.iter()) {
                grad[j] -= e / denom;
            }
        }
    }
    (nll, grad)
}

fn penalized_loss(nll: f64, theta: &[f64], l2: f64, n_races: usize) -> f64 {
    let ridge: f64 = theta.iter().map(|t| t * t).sum::<f64>() * 0.5 * l2;
    (nll + ridge) / n_races as f64
}

/// Fit skills from observed orders.
///
/// Orders with fewer than two finishers are excluded and reported as
/// `DegenerateRace`. Exhausting the iteration budget is not an error: the
/// lowest-loss parameters seen are returned with `converged = false`.
pub fn fit_skills(orders: &[TrainingOrder], config: &TrainingConfig) -> SkillFit {
    let mut warnings = Vec::new();
    let mut degenerate_races = Vec::new();
    let mut usable: Vec<&TrainingOrder> = Vec::new();

    for order in orders {
        if order.finishers.len() < 2 {
            tracing::warn!(
                "Race {} has {} valid finisher(s); excluded from likelihood",
                order.race_id,
                order.finishers.len()
            );
            degenerate_races.push(order.race_id.clone());
            warnings.push(EngineWarning::DegenerateRace {
                race_id: order.race_id.clone(),
                valid_finishers: order.finishers.len(),
            });
        } else {
            usable.push(order);
        }
    }

    let mut index: BTreeMap<CompetitorId, usize> = BTreeMap::new();
    for order in &usable {
        for id in &order.finishers {
            let next = index.len();
            index.entry(id.clone()).or_insert(next);
        }
    }
    // Re-number in sorted id order so the layout does not depend on race order.
    for (i, slot) in index.values_mut().enumerate() {
        *slot = i;
    }

    let indexed: Vec<Vec<usize>> = usable
        .iter()
        .map(|o| o.finishers.iter().map(|id| index[id]).collect())
        .collect();

    let n = index.len();
    let mut appearances = vec![0usize; n];
    for order in &indexed {
        for &i in order {
            appearances[i] += 1;
        }
    }

    if indexed.is_empty() {
        tracing::warn!("No usable races for skill estimation");
        return SkillFit {
            skills: BTreeMap::new(),
            converged: true,
            iterations: 0,
            final_loss: 0.0,
            races_used: 0,
            degenerate_races,
            loss_history: Vec::new(),
            warnings,
        };
    }

    let n_races = indexed.len();
    let l2 = config.l2_penalty;
    let mut theta = vec![0.0; n];
    let mut best_theta = theta.clone();
    let mut best_loss = f64::INFINITY;
    let mut prev_loss: Option<f64> = None;
    let mut loss_history = Vec::new();
    let mut converged = false;
    let mut iterations = 0;

    for iteration in 0..config.max_iterations {
        iterations = iteration + 1;
        let (nll, grad) = nll_and_gradient(&indexed, &theta);
        let loss = penalized_loss(nll, &theta, l2, n_races);
        loss_history.push(loss);

        if loss < best_loss {
            best_loss = loss;
            best_theta.copy_from_slice(&theta);
        }

        if iteration % 10 == 0 {
            tracing::debug!("ListMLE iter {}: loss={:.6}", iterations, loss);
        }

        if let Some(prev) = prev_loss {
            if (prev - loss).abs() < config.tolerance {
                converged = true;
                break;
            }
        }
        prev_loss = Some(loss);

        for i in 0..n {
            let ascent = (grad[i] - l2 * theta[i]) / appearances[i].max(1) as f64;
            theta[i] += config.learning_rate * ascent;
        }
    }

    if converged {
        tracing::info!("ListMLE converged after {} iterations (loss={:.6})", iterations, best_loss);
    } else {
        tracing::warn!(
            "ListMLE exhausted {} iterations without converging; returning best loss {:.6}",
            iterations,
            best_loss
        );
        warnings.push(EngineWarning::NonConvergence {
            stage: Stage::SkillEstimation,
            scope: "corpus".to_string(),
            iterations,
        });
    }

    let mean = best_theta.iter().sum::<f64>() / n as f64;
    let skills = index
        .into_iter()
        .map(|(id, i)| (id, best_theta[i] - mean))
        .collect();

    SkillFit {
        skills,
        converged,
        iterations,
        final_loss: best_loss,
        races_used: n_races,
        degenerate_races,
        loss_history,
        warnings,
    }
}

/// Screen a set of historical races, then fit.
///
/// Any forbidden feature name aborts before a single gradient step.
pub fn fit_from_races(
    races: &[&HistoricalRace],
    config: &TrainingConfig,
) -> Result<SkillFit, EngineError> {
    for race in races {
        race.screen_features("training")?;
    }

    let orders: Vec<TrainingOrder> = races.iter().map(|r| r.training_order()).collect();
    tracing::info!("Fitting skills on {} races", orders.len());
    Ok(fit_skills(&orders, config))
}
