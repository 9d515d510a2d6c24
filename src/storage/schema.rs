//! SQLite schema definitions for frozen predictions
//!
//! Tables:
//! - races: Race metadata (no market fields)
//! - predictions: One row per entrant with probabilities, rank and grade

use rusqlite::{Connection, Result};

/// Create all tables in the database
pub fn create_tables(conn: &Connection) -> Result<()> {
    // Race metadata
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS races (
            race_id TEXT PRIMARY KEY,
            surface TEXT,
            distance INTEGER,
            track_condition TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
        [],
    )?;

    // Per-entrant predictions
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS predictions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            race_id TEXT NOT NULL REFERENCES races(race_id),
            program_number INTEGER NOT NULL,
            competitor_id TEXT NOT NULL,
            skill REAL NOT NULL,
            win_raw REAL NOT NULL,
            place_raw REAL NOT NULL,
            win_cal REAL NOT NULL,
            place_cal REAL NOT NULL,
            predicted_rank INTEGER NOT NULL,
            grade TEXT NOT NULL,
            inference_converged INTEGER NOT NULL,
            inference_iterations INTEGER NOT NULL,
            grading_hash TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            frozen INTEGER NOT NULL DEFAULT 1,
            frozen_at TEXT NOT NULL,
            UNIQUE(race_id, program_number)
        )
        "#,
        [],
    )?;

    // Frozen rows are immutable
    conn.execute(
        r#"
        CREATE TRIGGER IF NOT EXISTS predictions_frozen_no_update
        BEFORE UPDATE ON predictions
        WHEN OLD.frozen = 1
        BEGIN
            SELECT RAISE(ABORT, 'prediction is frozen');
        END
        "#,
        [],
    )?;
    conn.execute(
        r#"
        CREATE TRIGGER IF NOT EXISTS predictions_frozen_no_delete
        BEFORE DELETE ON predictions
        WHEN OLD.frozen = 1
        BEGIN
            SELECT RAISE(ABORT, 'prediction is frozen');
        END
        "#,
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_predictions_race ON predictions(race_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_predictions_competitor ON predictions(competitor_id)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();

        let count: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
                 ('races', 'predictions')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);

        let triggers: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='trigger'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(triggers, 2);
    }

    #[test]
    fn test_create_tables_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        // Should not fail on second call
        create_tables(&conn).unwrap();
    }
}
