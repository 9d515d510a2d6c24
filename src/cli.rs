//! CLI commands for keiba-pl.
//!
//! Supports API server mode, offline training, the frozen batch run,
//! single-race prediction and split auditing.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::artifacts::{self, write_json};
use crate::audit::{verify_disjoint, SplitSummary};
use crate::calibration::Calibrator;
use crate::config::AppConfig;
use crate::corpus::{chronological_split, load_corpus, load_splits, Corpus, SplitSets};
use crate::model::{create_shared_model, SkillModel};
use crate::pipeline::{run_pipeline, RacePredictor};
use crate::skill::fit_from_races;
use crate::storage::PredictionRepository;
use crate::types::{RacePrediction, RaceRequest};

#[derive(Parser)]
#[command(name = "keiba-pl")]
#[command(version, about = "Plackett-Luce skill rating, rank probabilities and coverage grades", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the API server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },

    /// Fit skills on the train split and write the model artifact
    Train {
        /// Historical corpus (CSV or Parquet)
        #[arg(value_name = "CORPUS")]
        corpus: PathBuf,

        /// Split assignment CSV (race_id,split); 60/20/20 by race id if omitted
        #[arg(short, long)]
        splits: Option<PathBuf>,

        /// Model output path override
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Train, calibrate, evaluate and freeze all artifacts
    Run {
        /// Historical corpus (CSV or Parquet)
        #[arg(value_name = "CORPUS")]
        corpus: PathBuf,

        /// Split assignment CSV (race_id,split); 60/20/20 by race id if omitted
        #[arg(short, long)]
        splits: Option<PathBuf>,

        /// Artifact output directory
        #[arg(short, long, default_value = "data/artifacts")]
        out_dir: PathBuf,
    },

    /// Run prediction on a race JSON file
    Predict {
        /// Path to race request JSON file
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output format (json, table)
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Model path override
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Calibration artifact
        #[arg(short, long)]
        calibration: Option<PathBuf>,

        /// Freeze the prediction into this SQLite database
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Verify that splits are disjoint
    Audit {
        /// Split assignment CSV (race_id,split)
        #[arg(value_name = "SPLITS")]
        splits: PathBuf,

        /// Corpus to report exclusion statistics for
        #[arg(short, long)]
        corpus: Option<PathBuf>,
    },
}

fn resolve_splits(corpus: &Corpus, splits: Option<&Path>) -> anyhow::Result<SplitSets> {
    match splits {
        Some(path) => {
            eprintln!("Loading splits from: {}", path.display());
            load_splits(path)
        }
        None => {
            eprintln!("No split file given; using 60/20/20 split by race id");
            Ok(chronological_split(&corpus.race_ids(), 60, 20))
        }
    }
}

fn load_calibrator(path: Option<&Path>) -> anyhow::Result<Calibrator> {
    match path {
        Some(path) => {
            eprintln!("Loading calibrator from: {}", path.display());
            Calibrator::from_file(path)
                .with_context(|| format!("Failed to load calibrator {}", path.display()))
        }
        None => Ok(Calibrator::None),
    }
}

/// Fit skills only.
pub async fn run_train(
    corpus_path: PathBuf,
    splits_path: Option<PathBuf>,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    eprintln!("Loading corpus from: {}", corpus_path.display());
    let corpus = load_corpus(&corpus_path)?;
    let splits = resolve_splits(&corpus, splits_path.as_deref())?;
    verify_disjoint(&splits)?;

    let train = corpus.select(&splits.train);
    eprintln!("Training on {} races", train.len());
    let fit = fit_from_races(&train, &config.engine.training)?;
    let model = SkillModel::from_fit(fit, config.engine.inference.alpha, corpus.content_hash());

    let path = output.unwrap_or_else(|| PathBuf::from(&config.model.path));
    write_json(&path, &model)?;

    eprintln!(
        "Model written to {} ({} competitors, converged={}, iterations={}, loss={:.6})",
        path.display(),
        model.len(),
        model.converged,
        model.iterations,
        model.final_loss
    );
    for warning in &model.warnings {
        eprintln!("  warning: {}", warning);
    }
    Ok(())
}

/// Full frozen run.
pub async fn run_pipeline_command(
    corpus_path: PathBuf,
    splits_path: Option<PathBuf>,
    out_dir: PathBuf,
) -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    eprintln!("Loading corpus from: {}", corpus_path.display());
    let corpus = load_corpus(&corpus_path)?;
    let splits = resolve_splits(&corpus, splits_path.as_deref())?;

    let output = run_pipeline(&corpus, &splits, &config.engine)?;
    let written = artifacts::write_all(&out_dir, &output)?;

    for path in &written {
        eprintln!("Wrote {}", path.display());
    }
    let audit = &output.audit;
    println!("Predictions: {}", output.predictions.len());
    for report in &audit.calibration {
        println!(
            "  {:<5} ECE {:.4} -> {:.4}  MCE {:.4} -> {:.4}{}",
            report.target,
            report.before.ece,
            report.after.ece,
            report.before.mce,
            report.after.mce,
            if report.suspect { "  (suspect)" } else { "" }
        );
    }
    println!("RCC AUC: {:.4}", audit.rcc.auc);
    println!("Tie rate: {:.4}", audit.tie_rate);
    println!("Excluded entries: {:.2}%", audit.exclusion_ratio * 100.0);
    println!("Warnings: {}", audit.warnings.len());
    Ok(())
}

/// Run CLI prediction from file.
pub async fn run_predict(
    input: PathBuf,
    format: String,
    model_path: Option<PathBuf>,
    calibration_path: Option<PathBuf>,
    db: Option<PathBuf>,
) -> anyhow::Result<()> {
    // Load configuration
    let mut config = AppConfig::load()?;

    // Override model path if provided
    if let Some(path) = model_path {
        config.model.path = path.to_string_lossy().to_string();
    }
    let calibration_path = calibration_path.or_else(|| config.model.calibration_path.as_ref().map(PathBuf::from));

    eprintln!("Loading model from: {}", config.model.path);
    let model = create_shared_model(&config.model.path)?;
    let calibrator = load_calibrator(calibration_path.as_deref())?;

    let input_json = std::fs::read_to_string(&input)?;
    let req: RaceRequest = serde_json::from_str(&input_json)?;
    eprintln!("Processing race: {} ({} entrants)", req.race_id, req.entrants.len());

    let predictor = RacePredictor::new(&model, &calibrator, &config.engine);
    let prediction = predictor.predict_request(&req)?;

    if let Some(db_path) = db {
        let repo = PredictionRepository::new(&db_path)?;
        let frozen = prediction.clone().freeze()?;
        let frozen_at = repo.freeze_race(&frozen)?;
        let stored = repo.get_entries(frozen.race_id())?;
        if stored.iter().any(|s| s.content_hash != frozen.content_hash()) {
            anyhow::bail!("stored rows for race {} do not match the frozen hash", frozen.race_id());
        }
        eprintln!(
            "Froze race {} at {} ({}, {} rows, {} total)",
            frozen.race_id(),
            frozen_at.to_rfc3339(),
            frozen.content_hash(),
            stored.len(),
            repo.get_prediction_count()?
        );
    }

    match format.as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
        "table" => {
            print_table(&prediction);
        }
        _ => {
            eprintln!("Unknown format: {}. Using JSON.", format);
            println!("{}", serde_json::to_string_pretty(&prediction)?);
        }
    }

    Ok(())
}

/// Print prediction results in table format, best rank first.
fn print_table(prediction: &RacePrediction) {
    println!("Race: {}", prediction.race_id);
    if !prediction.inference_converged {
        println!("(inference did not converge in {} iterations)", prediction.inference_iterations);
    }
    println!();

    println!("Rank  No.  Grade  Competitor        Skill    Win%   Place%");
    let mut sorted: Vec<_> = prediction.entrants.iter().collect();
    sorted.sort_by_key(|e| e.predicted_rank);
    for e in sorted {
        println!(
            "{:>4}  {:>3}  {:>5}  {:<16} {:>6.3}  {:>5.1}  {:>6.1}",
            e.predicted_rank,
            e.program_number,
            e.grade.as_str(),
            e.competitor_id.as_str(),
            e.skill,
            e.win_cal * 100.0,
            e.place_cal * 100.0
        );
    }
}

/// Verify split disjointness.
pub async fn run_audit(splits_path: PathBuf, corpus_path: Option<PathBuf>) -> anyhow::Result<()> {
    let splits = load_splits(&splits_path)?;
    let summary = SplitSummary::from_sets(&splits);
    println!(
        "Splits: train={}, calibration={}, test={}",
        summary.train, summary.calibration, summary.test
    );

    if let Some(path) = corpus_path {
        let corpus = load_corpus(&path)?;
        let stats = corpus.exclusion_stats();
        println!(
            "Corpus: {} races, {} entries, {} excluded ({:.2}%)",
            corpus.races.len(),
            stats.total_entries,
            stats.excluded_entries,
            stats.ratio() * 100.0
        );
        for (reason, count) in &stats.by_reason {
            println!("  {}: {}", reason, count);
        }
    }

    verify_disjoint(&splits)?;
    println!("Split verification passed");
    Ok(())
}
