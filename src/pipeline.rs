//! End-to-end orchestration: per-race prediction and the frozen batch run.

use anyhow::{bail, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audit::{
    forbidden_keyword_list, grade_distribution, tie_rate, verify_disjoint, AuditRecord,
    InferenceSummary, ModelSummary, SplitSummary,
};
use crate::calibration::{evaluate, Calibrator, IsotonicCalibration};
use crate::config::{EngineConfig, InferenceConfig};
use crate::corpus::{Corpus, HistoricalRace, SplitSets};
use crate::error::{EngineError, EngineWarning};
use crate::grading::{assign_grades, GradeInput};
use crate::inference::infer_race;
use crate::metrics::risk_coverage;
use crate::model::SkillModel;
use crate::skill::fit_from_races;
use crate::types::{CompetitorId, EntrantPrediction, RaceMeta, RacePrediction, RaceRequest};

struct Runner {
    competitor_id: CompetitorId,
    program_number: u32,
}

/// Skill lookup, inference, calibration and grading for single races.
///
/// Holds only shared references, so one predictor serves many threads.
pub struct RacePredictor<'a> {
    model: &'a SkillModel,
    calibrator: &'a Calibrator,
    config: &'a EngineConfig,
    inference: InferenceConfig,
}

impl<'a> RacePredictor<'a> {
    /// Inference runs with the alpha frozen into the model.
    pub fn new(model: &'a SkillModel, calibrator: &'a Calibrator, config: &'a EngineConfig) -> Self {
        let mut inference = config.inference.clone();
        inference.alpha = model.alpha;
        Self {
            model,
            calibrator,
            config,
            inference,
        }
    }

    /// Predict a live request. Forbidden fields are rejected before any
    /// computation.
    pub fn predict_request(&self, req: &RaceRequest) -> Result<RacePrediction, EngineError> {
        req.validate()?;
        let mut runners: Vec<Runner> = req
            .entrants
            .iter()
            .map(|e| Runner {
                competitor_id: e.competitor_id.clone(),
                program_number: e.program_number,
            })
            .collect();
        runners.sort_by_key(|r| r.program_number);

        let (prediction, _) = self.predict_runners(&req.race_id, req.meta(), &runners)?;
        Ok(prediction)
    }

    /// Predict a historical race from its full field, DNF entrants included.
    pub fn predict_historical(
        &self,
        race: &HistoricalRace,
    ) -> Result<(RacePrediction, Option<EngineWarning>), EngineError> {
        race.screen_features("historical")?;
        let runners: Vec<Runner> = race
            .entrants
            .iter()
            .map(|e| Runner {
                competitor_id: e.competitor_id.clone(),
                program_number: e.program_number,
            })
            .collect();
        self.predict_runners(&race.race_id, race.meta.clone(), &runners)
    }

    /// Predict races in parallel; output order follows input order.
    pub fn predict_many(
        &self,
        races: &[&HistoricalRace],
    ) -> Result<Vec<(RacePrediction, Option<EngineWarning>)>, EngineError> {
        races
            .par_iter()
            .map(|race| self.predict_historical(race))
            .collect()
    }

    fn predict_runners(
        &self,
        race_id: &str,
        meta: RaceMeta,
        runners: &[Runner],
    ) -> Result<(RacePrediction, Option<EngineWarning>), EngineError> {
        let skills: Vec<f64> = runners
            .iter()
            .map(|r| self.model.skill_of(&r.competitor_id))
            .collect();
        let probs = infer_race(race_id, &skills, &self.inference)?;
        let (win_cal, place_cal) = self.calibrator.calibrate_race(&probs.win, &probs.place);

        let inputs: Vec<GradeInput> = runners
            .iter()
            .zip(&place_cal)
            .map(|(r, &p)| GradeInput {
                program_number: r.program_number,
                place_cal: p,
            })
            .collect();
        let assignment = assign_grades(&inputs, &self.config.grading);

        let entrants = runners
            .iter()
            .enumerate()
            .map(|(i, r)| EntrantPrediction {
                competitor_id: r.competitor_id.clone(),
                program_number: r.program_number,
                skill: skills[i],
                win_raw: probs.win[i],
                place_raw: probs.place[i],
                win_cal: win_cal[i],
                place_cal: place_cal[i],
                predicted_rank: assignment.ranks[i],
                grade: assignment.grades[i],
            })
            .collect();

        let prediction = RacePrediction {
            race_id: race_id.to_string(),
            meta,
            entrants,
            inference_converged: probs.converged,
            inference_iterations: probs.iterations,
            grading_hash: assignment.hash,
        };
        Ok((prediction, probs.warning))
    }
}

/// A prediction that can no longer change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenPrediction {
    content_hash: String,
    prediction: RacePrediction,
}

impl FrozenPrediction {
    pub fn prediction(&self) -> &RacePrediction {
        &self.prediction
    }

    pub fn race_id(&self) -> &str {
        &self.prediction.race_id
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}

impl RacePrediction {
    /// Seal the prediction with a SHA-256 hash of its JSON form.
    pub fn freeze(self) -> Result<FrozenPrediction, serde_json::Error> {
        let bytes = serde_json::to_vec(&self)?;
        let content_hash = format!("sha256:{:x}", Sha256::digest(&bytes));
        Ok(FrozenPrediction {
            content_hash,
            prediction: self,
        })
    }
}

/// (win, place) probability/outcome pairs for historical predictions.
///
/// Entrants without a valid finish count as neither winning nor placing.
fn outcome_pairs(
    races: &[&HistoricalRace],
    predictions: &[RacePrediction],
    place_positions: usize,
    calibrated: bool,
) -> (Vec<(f64, bool)>, Vec<(f64, bool)>) {
    let mut win = Vec::new();
    let mut place = Vec::new();
    for (race, prediction) in races.iter().zip(predictions) {
        for (entrant, pred) in race.entrants.iter().zip(&prediction.entrants) {
            let position = entrant.position();
            let won = position == Some(1);
            let placed = position.map_or(false, |p| p as usize <= place_positions);
            let (w, p) = if calibrated {
                (pred.win_cal, pred.place_cal)
            } else {
                (pred.win_raw, pred.place_raw)
            };
            win.push((w, won));
            place.push((p, placed));
        }
    }
    (win, place)
}

/// Everything a frozen run produces, held in memory until written.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub model: SkillModel,
    pub calibrator: Calibrator,
    pub predictions: Vec<FrozenPrediction>,
    pub audit: AuditRecord,
}

fn split_predictions(
    results: Vec<(RacePrediction, Option<EngineWarning>)>,
    warnings: &mut Vec<EngineWarning>,
) -> Vec<RacePrediction> {
    results
        .into_iter()
        .map(|(prediction, warning)| {
            warnings.extend(warning);
            prediction
        })
        .collect()
}

/// Fit skills, fit calibration, evaluate on the test split and build the
/// audit record.
///
/// Split leakage and forbidden inputs abort before any computation.
pub fn run_pipeline(
    corpus: &Corpus,
    splits: &SplitSets,
    config: &EngineConfig,
) -> Result<PipelineOutput> {
    config.validate()?;
    verify_disjoint(splits)?;

    let train = corpus.select(&splits.train);
    let calibration_races = corpus.select(&splits.calibration);
    let test = corpus.select(&splits.test);
    if train.is_empty() {
        bail!("no training races in corpus for the train split");
    }
    if calibration_races.is_empty() {
        return Err(EngineError::InvalidCalibration("calibration split has no races".to_string()).into());
    }
    for race in train.iter().chain(&calibration_races).chain(&test) {
        race.screen_features("pipeline")?;
    }
    tracing::info!(
        "Pipeline: {} train, {} calibration, {} test races",
        train.len(),
        calibration_races.len(),
        test.len()
    );

    // Skill estimation
    let fit = fit_from_races(&train, &config.training)?;
    let degenerate_races = fit.degenerate_races.clone();
    let model = SkillModel::from_fit(fit, config.inference.alpha, corpus.content_hash());
    let mut warnings = model.warnings.clone();

    // Calibration fit on raw probabilities of the calibration split
    let uncalibrated = Calibrator::None;
    let raw_predictor = RacePredictor::new(&model, &uncalibrated, config);
    let calib_predictions = split_predictions(raw_predictor.predict_many(&calibration_races)?, &mut warnings);
    let k = config.inference.place_positions;
    let (win_fit, place_fit) = outcome_pairs(&calibration_races, &calib_predictions, k, false);
    let calibrator = Calibrator::Isotonic(IsotonicCalibration::fit(
        &win_fit,
        &place_fit,
        k,
        calibration_races.len(),
    )?);

    // Held-out evaluation
    let predictor = RacePredictor::new(&model, &calibrator, config);
    let test_predictions = split_predictions(predictor.predict_many(&test)?, &mut warnings);

    let (win_raw, place_raw) = outcome_pairs(&test, &test_predictions, k, false);
    let (win_cal, place_cal) = outcome_pairs(&test, &test_predictions, k, true);
    let mut reports = Vec::new();
    for (target, raw, cal) in [("win", &win_raw, &win_cal), ("place", &place_raw, &place_cal)] {
        let (report, warning) = evaluate(target, raw, cal, &config.calibration);
        reports.push(report);
        warnings.extend(warning);
    }

    let rcc = risk_coverage(&place_cal, config.calibration.rcc_points);
    let ties = tie_rate(
        &test_predictions
            .iter()
            .map(|p| p.entrants.iter().map(|e| e.place_cal).collect())
            .collect::<Vec<Vec<f64>>>(),
    );
    let grades = grade_distribution(test_predictions.iter().flat_map(|p| p.entrants.iter().map(|e| &e.grade)));

    let unconverged_races: Vec<String> = test_predictions
        .iter()
        .filter(|p| !p.inference_converged)
        .map(|p| p.race_id.clone())
        .collect();
    let exclusions = corpus.exclusion_stats();

    let audit = AuditRecord {
        splits: SplitSummary::from_sets(splits),
        exclusion_ratio: exclusions.ratio(),
        exclusions,
        degenerate_races,
        model: ModelSummary {
            competitors: model.len(),
            alpha: model.alpha,
            converged: model.converged,
            iterations: model.iterations,
            final_loss: model.final_loss,
            races_used: model.races_used,
            corpus_hash: model.corpus_hash.clone(),
        },
        inference: InferenceSummary {
            races: test_predictions.len(),
            converged: test_predictions.len() - unconverged_races.len(),
            unconverged_races,
        },
        calibration: reports,
        rcc,
        tie_rate: ties,
        grade_distribution: grades,
        forbidden_keywords: forbidden_keyword_list(),
        warnings,
    };

    let predictions = test_predictions
        .into_iter()
        .map(RacePrediction::freeze)
        .collect::<Result<Vec<_>, _>>()?;

    tracing::info!(
        "Pipeline complete: {} predictions, RCC AUC {:.4}, tie rate {:.4}",
        predictions.len(),
        audit.rcc.auc,
        audit.tie_rate
    );

    Ok(PipelineOutput {
        model,
        calibrator,
        predictions,
        audit,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::corpus::{chronological_split, CorpusRow, Split};
    use std::collections::BTreeMap;

    /// Deterministic synthetic corpus: horse `Hk` has true strength `-k/4`,
    /// finishing order perturbed by a fixed LCG.
    pub(crate) fn synthetic_corpus(races: usize) -> Corpus {
        let mut state: u64 = 12345;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as f64 / (1u64 << 31) as f64
        };

        let mut rows = Vec::new();
        for r in 0..races {
            let race_id = format!("2024{:06}", r);
            let field: Vec<usize> = (0..8).map(|i| (r + i) % 12).collect();
            let mut scored: Vec<(f64, usize, u32)> = field
                .iter()
                .enumerate()
                .map(|(slot, &h)| (-(h as f64) / 4.0 + next() * 1.5, h, slot as u32 + 1))
                .collect();
            scored.sort_by(|a, b| b.0.total_cmp(&a.0));
            for (pos, &(_, h, num)) in scored.iter().enumerate() {
                let mut features = BTreeMap::new();
                features.insert("horse_weight".to_string(), 460.0 + h as f64);
                rows.push(CorpusRow {
                    race_id: race_id.clone(),
                    competitor_id: format!("H{}", h),
                    program_number: num,
                    finish_position: Some(pos as i64 + 1),
                    surface: Some("turf".to_string()),
                    distance: Some(1600),
                    features,
                    ..Default::default()
                });
            }
        }
        Corpus::from_rows(rows)
    }

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.training.max_iterations = 100;
        config
    }

    #[test]
    fn test_pipeline_produces_graded_predictions() {
        let corpus = synthetic_corpus(40);
        let splits = chronological_split(&corpus.race_ids(), 60, 20);
        let out = run_pipeline(&corpus, &splits, &small_config()).unwrap();

        assert_eq!(out.predictions.len(), 8);
        assert!(out.calibrator.is_enabled());
        assert!(out.audit.splits.disjoint);
        assert_eq!(out.audit.calibration.len(), 2);
        assert!(out.audit.rcc.auc >= 0.0);
        assert_eq!(out.audit.grade_distribution.values().sum::<usize>(), 8 * 8);

        for frozen in &out.predictions {
            let p = frozen.prediction();
            let win: f64 = p.entrants.iter().map(|e| e.win_cal).sum();
            assert!((win - 1.0).abs() < 1e-9);
            assert!(p.entrants.iter().all(|e| (0.0..=1.0).contains(&e.place_cal)));
            assert!(frozen.content_hash().starts_with("sha256:"));
        }

        // Strongest horse should out-rate the weakest
        let h0 = out.model.skill_of(&CompetitorId::new("H0"));
        let h11 = out.model.skill_of(&CompetitorId::new("H11"));
        assert!(h0 > h11);
    }

    #[test]
    fn test_pipeline_is_byte_reproducible() {
        let corpus = synthetic_corpus(30);
        let splits = chronological_split(&corpus.race_ids(), 60, 20);
        let a = run_pipeline(&corpus, &splits, &small_config()).unwrap();
        let b = run_pipeline(&corpus, &splits, &small_config()).unwrap();

        assert_eq!(
            serde_json::to_vec(&a.predictions).unwrap(),
            serde_json::to_vec(&b.predictions).unwrap()
        );
        assert_eq!(
            serde_json::to_vec(&a.audit).unwrap(),
            serde_json::to_vec(&b.audit).unwrap()
        );
        assert_eq!(a.model, b.model);
    }

    #[test]
    fn test_leaked_split_aborts_before_training() {
        let corpus = synthetic_corpus(10);
        let mut splits = chronological_split(&corpus.race_ids(), 60, 20);
        let leaked = splits.train.iter().next().cloned().unwrap();
        splits.test.insert(leaked.clone());

        let err = run_pipeline(&corpus, &splits, &small_config()).unwrap_err();
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::SplitLeakage { race_id, first, second }) => {
                assert_eq!(race_id, &leaked);
                assert_eq!(*first, Split::Train);
                assert_eq!(*second, Split::Test);
            }
            other => panic!("expected SplitLeakage, got {:?}", other),
        }
    }

    #[test]
    fn test_predict_request_grades_every_entrant() {
        let corpus = synthetic_corpus(20);
        let races: Vec<&HistoricalRace> = corpus.races.iter().collect();
        let config = small_config();
        let fit = fit_from_races(&races, &config.training).unwrap();
        let model = SkillModel::from_fit(fit, 0.5, corpus.content_hash());
        let calibrator = Calibrator::None;
        let predictor = RacePredictor::new(&model, &calibrator, &config);

        let req: RaceRequest = serde_json::from_str(
            r#"{"race_id": "LIVE1", "entrants": [
                {"competitor_id": "H3", "program_number": 2},
                {"competitor_id": "H0", "program_number": 1},
                {"competitor_id": "NEWCOMER", "program_number": 3},
                {"competitor_id": "H9", "program_number": 4}
            ]}"#,
        )
        .unwrap();
        let prediction = predictor.predict_request(&req).unwrap();

        let numbers: Vec<u32> = prediction.entrants.iter().map(|e| e.program_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(prediction.entrants[2].skill, 0.0);
        let mut ranks: Vec<usize> = prediction.entrants.iter().map(|e| e.predicted_rank).collect();
        ranks.sort();
        assert_eq!(ranks, vec![1, 2, 3, 4]);
        // H0 is the strongest
        assert_eq!(prediction.entrants[0].predicted_rank, 1);
    }

    #[test]
    fn test_predict_request_rejects_odds_before_inference() {
        let model = SkillModel::from_fit(
            crate::skill::fit_skills(&[], &Default::default()),
            0.5,
            String::new(),
        );
        let calibrator = Calibrator::None;
        let config = EngineConfig::default();
        let predictor = RacePredictor::new(&model, &calibrator, &config);

        let req: RaceRequest = serde_json::from_str(
            r#"{"race_id": "R1", "entrants": [
                {"competitor_id": "H1", "program_number": 1, "features": {"tansho_odds": 2.1}}
            ]}"#,
        )
        .unwrap();
        assert!(matches!(
            predictor.predict_request(&req),
            Err(EngineError::ForbiddenInput { .. })
        ));
    }

    #[test]
    fn test_odds_on_a_test_race_aborts_run() {
        let mut corpus = synthetic_corpus(20);
        let splits = chronological_split(&corpus.race_ids(), 60, 20);
        let test_race = splits.test.iter().next().cloned().unwrap();
        let race = corpus.races.iter_mut().find(|r| r.race_id == test_race).unwrap();
        race.entrants[0].features.insert("tansho_odds".to_string(), 3.2);

        let err = run_pipeline(&corpus, &splits, &small_config()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::ForbiddenInput { field, .. }) if field == "tansho_odds"
        ));
    }

    #[test]
    fn test_predict_historical_screens_features() {
        let mut corpus = synthetic_corpus(2);
        corpus.races[1].entrants[3].features.insert("ninki".to_string(), 1.0);
        let model = SkillModel::from_fit(
            crate::skill::fit_skills(&[], &Default::default()),
            0.5,
            String::new(),
        );
        let calibrator = Calibrator::None;
        let config = EngineConfig::default();
        let predictor = RacePredictor::new(&model, &calibrator, &config);

        assert!(predictor.predict_historical(&corpus.races[0]).is_ok());
        assert!(matches!(
            predictor.predict_historical(&corpus.races[1]),
            Err(EngineError::ForbiddenInput { .. })
        ));
    }

    #[test]
    fn test_freeze_hash_tracks_content() {
        let corpus = synthetic_corpus(6);
        let model = SkillModel::from_fit(
            crate::skill::fit_skills(&[], &Default::default()),
            0.5,
            String::new(),
        );
        let calibrator = Calibrator::None;
        let config = EngineConfig::default();
        let predictor = RacePredictor::new(&model, &calibrator, &config);

        let (a, _) = predictor.predict_historical(&corpus.races[0]).unwrap();
        let (b, _) = predictor.predict_historical(&corpus.races[1]).unwrap();
        let fa = a.clone().freeze().unwrap();
        assert_eq!(fa.content_hash(), a.freeze().unwrap().content_hash());
        assert_ne!(fa.content_hash(), b.freeze().unwrap().content_hash());
        assert_eq!(fa.race_id(), corpus.races[0].race_id);
    }
}
