//! Historical corpus loading, finishing-order construction and split sets.
//!
//! The corpus is read with polars from CSV or Parquet. Column names are
//! screened for market-derived fields before any row is materialized.

use anyhow::{bail, Context};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use crate::error::EngineError;
use crate::forbidden::ensure_allowed;
use crate::types::{CompetitorId, RaceMeta};

/// Status markers that exclude an entrant from the finishing order.
pub const EXCLUSION_KEYWORDS: [&str; 10] = [
    "中止", "除外", "失格", "取消", "競走中止", "出走取消", "DQ", "DNF", "SCR", "DISQ",
];

/// Columns with a fixed meaning; anything else is a pre-race feature.
const RESERVED_COLUMNS: [&str; 8] = [
    "race_id",
    "competitor_id",
    "program_number",
    "finish_position",
    "status",
    "surface",
    "distance",
    "condition",
];

/// One raw corpus row.
#[derive(Debug, Clone, Default)]
pub struct CorpusRow {
    pub race_id: String,
    pub competitor_id: String,
    pub program_number: u32,
    pub finish_position: Option<i64>,
    pub status: Option<String>,
    pub surface: Option<String>,
    pub distance: Option<u32>,
    pub condition: Option<String>,
    pub features: BTreeMap<String, f64>,
}

/// Why an entrant was left out of the finishing order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    MissingOrInvalidRank,
    StatusKeyword,
    MissingCompetitorId,
}

impl ExclusionReason {
    pub fn name(&self) -> &'static str {
        match self {
            ExclusionReason::MissingOrInvalidRank => "missing_or_invalid_rank",
            ExclusionReason::StatusKeyword => "status_keyword",
            ExclusionReason::MissingCompetitorId => "missing_competitor_id",
        }
    }
}

/// Finishing outcome of one historical entrant.
#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    Position(u32),
    Excluded(ExclusionReason),
}

#[derive(Debug, Clone)]
pub struct HistoricalEntrant {
    pub competitor_id: CompetitorId,
    pub program_number: u32,
    pub finish: Finish,
    pub features: BTreeMap<String, f64>,
}

impl HistoricalEntrant {
    pub fn position(&self) -> Option<u32> {
        match self.finish {
            Finish::Position(p) => Some(p),
            Finish::Excluded(_) => None,
        }
    }
}

/// A historical race with all its entrants, DNF included.
#[derive(Debug, Clone)]
pub struct HistoricalRace {
    pub race_id: String,
    pub meta: RaceMeta,
    pub entrants: Vec<HistoricalEntrant>,
}

/// Observed finishing order used as supervision.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOrder {
    pub race_id: String,
    /// First place first.
    pub finishers: Vec<CompetitorId>,
    pub excluded: Vec<(CompetitorId, ExclusionReason)>,
}

impl HistoricalRace {
    /// Build the observed order. Equal positions fall back to program number.
    pub fn training_order(&self) -> TrainingOrder {
        let mut placed: Vec<&HistoricalEntrant> =
            self.entrants.iter().filter(|e| e.position().is_some()).collect();
        placed.sort_by_key(|e| (e.position(), e.program_number));

        let excluded = self
            .entrants
            .iter()
            .filter_map(|e| match &e.finish {
                Finish::Excluded(reason) => Some((e.competitor_id.clone(), reason.clone())),
                Finish::Position(_) => None,
            })
            .collect();

        TrainingOrder {
            race_id: self.race_id.clone(),
            finishers: placed.into_iter().map(|e| e.competitor_id.clone()).collect(),
            excluded,
        }
    }

    /// Fail on the first entrant feature that carries a market signal.
    pub fn screen_features(&self, stage: &str) -> Result<(), EngineError> {
        let origin = format!("{} race {}", stage, self.race_id);
        for entrant in &self.entrants {
            ensure_allowed(entrant.features.keys().map(String::as_str), &origin)?;
        }
        Ok(())
    }
}

/// Entry-level exclusion tally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExclusionStats {
    pub total_entries: usize,
    pub excluded_entries: usize,
    pub by_reason: BTreeMap<String, usize>,
}

impl ExclusionStats {
    pub fn ratio(&self) -> f64 {
        if self.total_entries > 0 {
            self.excluded_entries as f64 / self.total_entries as f64
        } else {
            0.0
        }
    }
}

/// Historical corpus, races ordered by race id.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    pub races: Vec<HistoricalRace>,
}

fn classify(row: &CorpusRow) -> Finish {
    let id = CompetitorId::new(row.competitor_id.clone());
    if id.is_missing() {
        return Finish::Excluded(ExclusionReason::MissingCompetitorId);
    }
    if let Some(status) = &row.status {
        let upper = status.to_uppercase();
        if EXCLUSION_KEYWORDS.iter().any(|kw| upper.contains(kw)) {
            return Finish::Excluded(ExclusionReason::StatusKeyword);
        }
    }
    match row.finish_position {
        Some(p) if p > 0 => Finish::Position(p as u32),
        _ => Finish::Excluded(ExclusionReason::MissingOrInvalidRank),
    }
}

impl Corpus {
    /// Group rows into races. Race and entrant order is deterministic.
    pub fn from_rows(rows: Vec<CorpusRow>) -> Self {
        let mut grouped: BTreeMap<String, HistoricalRace> = BTreeMap::new();

        for row in rows {
            let finish = classify(&row);
            let race = grouped.entry(row.race_id.clone()).or_insert_with(|| HistoricalRace {
                race_id: row.race_id.clone(),
                meta: RaceMeta {
                    surface: row.surface.clone(),
                    distance: row.distance,
                    condition: row.condition.clone(),
                },
                entrants: Vec::new(),
            });
            race.entrants.push(HistoricalEntrant {
                competitor_id: CompetitorId::new(row.competitor_id),
                program_number: row.program_number,
                finish,
                features: row.features,
            });
        }

        let mut races: Vec<HistoricalRace> = grouped.into_values().collect();
        for race in &mut races {
            race.entrants.sort_by(|a, b| {
                a.program_number
                    .cmp(&b.program_number)
                    .then_with(|| a.competitor_id.cmp(&b.competitor_id))
            });
        }
        Self { races }
    }

    pub fn race_ids(&self) -> Vec<String> {
        self.races.iter().map(|r| r.race_id.clone()).collect()
    }

    /// Races whose id is in `ids`, in corpus order.
    pub fn select<'a>(&'a self, ids: &BTreeSet<String>) -> Vec<&'a HistoricalRace> {
        self.races.iter().filter(|r| ids.contains(&r.race_id)).collect()
    }

    pub fn exclusion_stats(&self) -> ExclusionStats {
        let mut stats = ExclusionStats::default();
        for entrant in self.races.iter().flat_map(|r| r.entrants.iter()) {
            stats.total_entries += 1;
            if let Finish::Excluded(reason) = &entrant.finish {
                stats.excluded_entries += 1;
                *stats.by_reason.entry(reason.name().to_string()).or_insert(0) += 1;
            }
        }
        stats
    }

    /// SHA-256 over the normalized (race, competitor, program, position) tuples.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for race in &self.races {
            for e in &race.entrants {
                let position = e.position().map(|p| p.to_string()).unwrap_or_default();
                hasher.update(
                    format!(
                        "{},{},{},{}\n",
                        race.race_id, e.competitor_id, e.program_number, position
                    )
                    .as_bytes(),
                );
            }
        }
        format!("sha256:{:x}", hasher.finalize())
    }
}

fn read_frame(path: &Path) -> anyhow::Result<DataFrame> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let df = match ext.as_str() {
        "parquet" => LazyFrame::scan_parquet(path, Default::default())?.collect()?,
        "csv" => CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?,
        other => bail!("unsupported corpus format `{}` for {}", other, path.display()),
    };
    Ok(df)
}

fn string_values(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<String>>> {
    let col = df.column(name)?.cast(&DataType::String)?;
    Ok(col.str()?.into_iter().map(|v| v.map(str::to_string)).collect())
}

fn int_values(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<i64>>> {
    let col = df.column(name)?.cast(&DataType::Int64)?;
    Ok(col.i64()?.into_iter().collect())
}

fn float_values(df: &DataFrame, name: &str) -> anyhow::Result<Vec<Option<f64>>> {
    let col = df.column(name)?.cast(&DataType::Float64)?;
    Ok(col.f64()?.into_iter().collect())
}

fn optional<T>(
    df: &DataFrame,
    columns: &[String],
    name: &str,
    read: fn(&DataFrame, &str) -> anyhow::Result<Vec<Option<T>>>,
) -> anyhow::Result<Vec<Option<T>>> {
    if columns.iter().any(|c| c == name) {
        read(df, name)
    } else {
        Ok((0..df.height()).map(|_| None).collect())
    }
}

/// Load the historical corpus from CSV or Parquet.
///
/// Fails with `EngineError::ForbiddenInput` when any column looks
/// market-derived; no rows are read in that case.
pub fn load_corpus<P: AsRef<Path>>(path: P) -> anyhow::Result<Corpus> {
    let path = path.as_ref();
    let df = read_frame(path).with_context(|| format!("reading corpus {}", path.display()))?;

    let columns: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
    ensure_allowed(columns.iter().map(String::as_str), &path.display().to_string())?;

    let race_ids = string_values(&df, "race_id")?;
    let competitor_ids = string_values(&df, "competitor_id")?;
    let program_numbers = int_values(&df, "program_number")?;
    let positions = optional(&df, &columns, "finish_position", int_values)?;
    let statuses = optional(&df, &columns, "status", string_values)?;
    let surfaces = optional(&df, &columns, "surface", string_values)?;
    let distances = optional(&df, &columns, "distance", int_values)?;
    let conditions = optional(&df, &columns, "condition", string_values)?;

    let mut feature_columns: Vec<(String, Vec<Option<f64>>)> = Vec::new();
    for name in columns.iter().filter(|c| !RESERVED_COLUMNS.contains(&c.as_str())) {
        feature_columns.push((name.clone(), float_values(&df, name)?));
    }

    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let race_id = match &race_ids[i] {
            Some(id) if !id.is_empty() => id.clone(),
            _ => bail!("row {} has no race_id", i),
        };
        let features = feature_columns
            .iter()
            .filter_map(|(name, values)| values[i].map(|v| (name.clone(), v)))
            .collect();

        rows.push(CorpusRow {
            race_id,
            competitor_id: competitor_ids[i].clone().unwrap_or_default(),
            program_number: program_numbers[i].unwrap_or(0).max(0) as u32,
            finish_position: positions[i],
            status: statuses[i].clone(),
            surface: surfaces[i].clone(),
            distance: distances[i].map(|d| d.max(0) as u32),
            condition: conditions[i].clone(),
            features,
        });
    }

    let corpus = Corpus::from_rows(rows);
    tracing::info!(
        "Loaded corpus {}: {} races, {} entries",
        path.display(),
        corpus.races.len(),
        df.height()
    );
    Ok(corpus)
}

/// Race-level data split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Calibration,
    Test,
}

impl Split {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "train" => Some(Split::Train),
            "calibration" | "calib" => Some(Split::Calibration),
            "test" => Some(Split::Test),
            _ => None,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Split::Train => write!(f, "train"),
            Split::Calibration => write!(f, "calibration"),
            Split::Test => write!(f, "test"),
        }
    }
}

/// The three race-id sets. Not guaranteed disjoint until audited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitSets {
    pub train: BTreeSet<String>,
    pub calibration: BTreeSet<String>,
    pub test: BTreeSet<String>,
}

impl SplitSets {
    /// Fold (race id, split) assignments. A race listed under two splits
    /// lands in both sets so the audit can report it.
    pub fn from_assignments<I>(assignments: I) -> Self
    where
        I: IntoIterator<Item = (String, Split)>,
    {
        let mut sets = SplitSets::default();
        for (race_id, split) in assignments {
            sets.get_mut(split).insert(race_id);
        }
        sets
    }

    pub fn get(&self, split: Split) -> &BTreeSet<String> {
        match split {
            Split::Train => &self.train,
            Split::Calibration => &self.calibration,
            Split::Test => &self.test,
        }
    }

    fn get_mut(&mut self, split: Split) -> &mut BTreeSet<String> {
        match split {
            Split::Train => &mut self.train,
            Split::Calibration => &mut self.calibration,
            Split::Test => &mut self.test,
        }
    }
}

/// Deterministic race-level split over sorted race ids.
///
/// Shares are percentages for train and calibration; test takes the rest.
pub fn chronological_split(race_ids: &[String], train_pct: usize, calib_pct: usize) -> SplitSets {
    let mut ids = race_ids.to_vec();
    ids.sort();
    ids.dedup();

    let n = ids.len();
    let n_train = n * train_pct / 100;
    let n_calib = n * calib_pct / 100;

    let mut sets = SplitSets::default();
    for (i, id) in ids.into_iter().enumerate() {
        if i < n_train {
            sets.train.insert(id);
        } else if i < n_train + n_calib {
            sets.calibration.insert(id);
        } else {
            sets.test.insert(id);
        }
    }
    sets
}

/// Load split assignments from a CSV with `race_id` and `split` columns.
pub fn load_splits<P: AsRef<Path>>(path: P) -> anyhow::Result<SplitSets> {
    let path = path.as_ref();
    let df = CsvReadOptions::default()
        .with_has_header(true)
        .try_into_reader_with_file_path(Some(path.to_path_buf()))?
        .finish()
        .with_context(|| format!("reading splits {}", path.display()))?;

    let race_ids = string_values(&df, "race_id")?;
    let labels = string_values(&df, "split")?;

    let mut assignments = Vec::with_capacity(df.height());
    for (i, (race_id, label)) in race_ids.into_iter().zip(labels).enumerate() {
        let race_id = race_id.with_context(|| format!("split row {} has no race_id", i))?;
        let label = label.unwrap_or_default();
        let split = Split::from_str(&label)
            .with_context(|| format!("unknown split `{}` for race {}", label, race_id))?;
        assignments.push((race_id, split));
    }
    Ok(SplitSets::from_assignments(assignments))
}
