//! SQLite repository for frozen predictions

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

use super::schema::create_tables;
use crate::grading::Grade;
use crate::pipeline::FrozenPrediction;
use crate::types::{CompetitorId, EntrantPrediction};

/// One stored entrant row
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub race_id: String,
    pub entrant: EntrantPrediction,
    pub content_hash: String,
    pub frozen_at: DateTime<Utc>,
}

/// Repository for frozen predictions
pub struct PredictionRepository {
    conn: Connection,
}

impl PredictionRepository {
    /// Create a new repository, initializing the database if needed
    pub fn new(db_path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(db_path).context("Failed to open database")?;

        // Enable foreign keys
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        // Create tables if they don't exist
        create_tables(&conn)?;

        Ok(Self { conn })
    }

    /// Create an in-memory repository (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        create_tables(&conn)?;
        Ok(Self { conn })
    }

    /// Check whether a race already has frozen predictions
    pub fn is_frozen(&self, race_id: &str) -> Result<bool> {
        let count: i32 = self.conn.query_row(
            "SELECT COUNT(*) FROM predictions WHERE race_id = ?1 AND frozen = 1",
            [race_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Store a frozen prediction. Freezing a race twice is an error.
    pub fn freeze_race(&self, frozen: &FrozenPrediction) -> Result<DateTime<Utc>> {
        let prediction = frozen.prediction();
        if self.is_frozen(&prediction.race_id)? {
            bail!("race {} is already frozen", prediction.race_id);
        }

        let frozen_at = Utc::now();
        let stamp = frozen_at.to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT OR IGNORE INTO races (race_id, surface, distance, track_condition)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                prediction.race_id,
                prediction.meta.surface,
                prediction.meta.distance,
                prediction.meta.condition,
            ],
        )?;

        for e in &prediction.entrants {
            tx.execute(
                r#"
                INSERT INTO predictions
                (race_id, program_number, competitor_id, skill, win_raw, place_raw,
                 win_cal, place_cal, predicted_rank, grade, inference_converged,
                 inference_iterations, grading_hash, content_hash, frozen, frozen_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 1, ?15)
                "#,
                params![
                    prediction.race_id,
                    e.program_number,
                    e.competitor_id.as_str(),
                    e.skill,
                    e.win_raw,
                    e.place_raw,
                    e.win_cal,
                    e.place_cal,
                    e.predicted_rank as i64,
                    e.grade.as_str(),
                    prediction.inference_converged,
                    prediction.inference_iterations as i64,
                    prediction.grading_hash,
                    frozen.content_hash(),
                    stamp,
                ],
            )?;
        }

        tx.commit()?;
        tracing::info!(
            "Froze {} predictions for race {}",
            prediction.entrants.len(),
            prediction.race_id
        );
        Ok(frozen_at)
    }

    /// Get stored entries for a race, in program-number order
    pub fn get_entries(&self, race_id: &str) -> Result<Vec<StoredEntry>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT race_id, program_number, competitor_id, skill, win_raw, place_raw,
                   win_cal, place_cal, predicted_rank, grade, content_hash, frozen_at
            FROM predictions
            WHERE race_id = ?1
            ORDER BY program_number
            "#,
        )?;

        let rows = stmt
            .query_map([race_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    [
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, f64>(7)?,
                    ],
                    row.get::<_, i64>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                    row.get::<_, String>(11)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (race_id, program_number, competitor_id, probs, rank, grade, content_hash, stamp) in rows {
            let grade = Grade::parse(&grade)
                .with_context(|| format!("unknown grade `{}` in race {}", grade, race_id))?;
            let frozen_at = DateTime::parse_from_rfc3339(&stamp)
                .with_context(|| format!("bad frozen_at `{}`", stamp))?
                .with_timezone(&Utc);
            entries.push(StoredEntry {
                race_id,
                entrant: EntrantPrediction {
                    competitor_id: CompetitorId::new(competitor_id),
                    program_number,
                    skill: probs[0],
                    win_raw: probs[1],
                    place_raw: probs[2],
                    win_cal: probs[3],
                    place_cal: probs[4],
                    predicted_rank: rank.max(0) as usize,
                    grade,
                },
                content_hash,
                frozen_at,
            });
        }
        Ok(entries)
    }

    /// Get total prediction row count
    pub fn get_prediction_count(&self) -> Result<i32> {
        let count: i32 = self
            .conn
            .query_row("SELECT COUNT(*) FROM predictions", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RaceMeta, RacePrediction};

    fn create_test_prediction(race_id: &str) -> FrozenPrediction {
        let entrants = (1..=3)
            .map(|n| EntrantPrediction {
                competitor_id: CompetitorId::new(format!("horse_{}", n)),
                program_number: n,
                skill: 0.5 - n as f64 * 0.25,
                win_raw: [0.5, 0.3, 0.2][n as usize - 1],
                place_raw: 1.0,
                win_cal: [0.5, 0.3, 0.2][n as usize - 1],
                place_cal: 1.0,
                predicted_rank: n as usize,
                grade: [Grade::S, Grade::C, Grade::N][n as usize - 1],
            })
            .collect();
        RacePrediction {
            race_id: race_id.to_string(),
            meta: RaceMeta {
                surface: Some("turf".to_string()),
                distance: Some(1600),
                condition: None,
            },
            entrants,
            inference_converged: true,
            inference_iterations: 31,
            grading_hash: "sha256:test".to_string(),
        }
        .freeze()
        .unwrap()
    }

    #[test]
    fn test_freeze_and_get_entries() {
        let repo = PredictionRepository::in_memory().unwrap();
        let frozen = create_test_prediction("202401010101");

        assert!(!repo.is_frozen("202401010101").unwrap());
        repo.freeze_race(&frozen).unwrap();
        assert!(repo.is_frozen("202401010101").unwrap());

        let entries = repo.get_entries("202401010101").unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].entrant, frozen.prediction().entrants[0]);
        assert_eq!(entries[2].entrant.grade, Grade::N);
        assert_eq!(entries[0].content_hash, frozen.content_hash());
    }

    #[test]
    fn test_refreeze_is_rejected() {
        let repo = PredictionRepository::in_memory().unwrap();
        let frozen = create_test_prediction("R1");
        repo.freeze_race(&frozen).unwrap();

        assert!(repo.freeze_race(&frozen).is_err());
        assert_eq!(repo.get_prediction_count().unwrap(), 3);
    }

    #[test]
    fn test_frozen_rows_cannot_be_updated_or_deleted() {
        let repo = PredictionRepository::in_memory().unwrap();
        repo.freeze_race(&create_test_prediction("R1")).unwrap();

        let update = repo.conn.execute(
            "UPDATE predictions SET grade = 'S' WHERE race_id = 'R1'",
            [],
        );
        assert!(update.unwrap_err().to_string().contains("frozen"));

        let delete = repo.conn.execute("DELETE FROM predictions WHERE race_id = 'R1'", []);
        assert!(delete.is_err());
        assert_eq!(repo.get_prediction_count().unwrap(), 3);
    }

    #[test]
    fn test_file_backed_repository_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("predictions.sqlite");
        {
            let repo = PredictionRepository::new(&path).unwrap();
            repo.freeze_race(&create_test_prediction("R1")).unwrap();
        }
        let repo = PredictionRepository::new(&path).unwrap();
        assert!(repo.is_frozen("R1").unwrap());
    }
}
