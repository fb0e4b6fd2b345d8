use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result, ToSql};

use crate::models::{
    percent, ActiveItem, Attempt, Cell, CellStats, Format, Mode, Outcome, OverallStats,
    ProgressionState, Topic, WeakPoint,
};
use crate::ports::{AttemptLog, NewAttempt, ProgressStore};

// Fixed-width timestamps so that text comparison orders them correctly.
fn to_db_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn from_db_time(idx: usize, s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn unknown_name(kind: &str, value: &str) -> FromSqlError {
    FromSqlError::Other(format!("unknown {} '{}' in database", kind, value).into())
}

impl ToSql for Topic {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Topic {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Topic::from_str(s).ok_or_else(|| unknown_name("topic", s))
    }
}

impl ToSql for Format {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Format {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Format::from_str(s).ok_or_else(|| unknown_name("format", s))
    }
}

impl ToSql for Outcome {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Outcome {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Outcome::from_str(s).ok_or_else(|| unknown_name("outcome", s))
    }
}

impl ToSql for Mode {
    fn to_sql(&self) -> Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for Mode {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Mode::from_str(s).ok_or_else(|| unknown_name("mode", s))
    }
}

const ATTEMPT_COLUMNS: &str =
    "id, learner, topic, format, item_id, answer, outcome, feedback, recorded_at";

fn attempt_from_row(row: &rusqlite::Row<'_>) -> Result<Attempt> {
    Ok(Attempt {
        id: row.get(0)?,
        learner: row.get(1)?,
        topic: row.get(2)?,
        format: row.get(3)?,
        item_id: row.get(4)?,
        answer: row.get(5)?,
        outcome: row.get(6)?,
        feedback: row.get(7)?,
        recorded_at: from_db_time(8, row.get(8)?)?,
    })
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS attempts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                learner TEXT NOT NULL,
                topic TEXT NOT NULL,
                format TEXT NOT NULL,
                answer TEXT NOT NULL DEFAULT '',
                outcome TEXT NOT NULL CHECK(outcome IN ('correct', 'partial', 'incorrect')),
                feedback TEXT NOT NULL DEFAULT '',
                recorded_at TEXT NOT NULL
            );

            -- One row per learner; completed cells and recent items hang off it
            CREATE TABLE IF NOT EXISTS progression (
                learner TEXT PRIMARY KEY,
                current_topic TEXT NOT NULL,
                current_format TEXT NOT NULL,
                format_attempt_count INTEGER NOT NULL DEFAULT 0,
                format_window_start TEXT NOT NULL,
                curriculum_complete INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS completed_cells (
                learner TEXT NOT NULL,
                topic TEXT NOT NULL,
                format TEXT NOT NULL,
                PRIMARY KEY (learner, topic, format)
            );

            CREATE TABLE IF NOT EXISTS recent_items (
                learner TEXT NOT NULL,
                topic TEXT NOT NULL,
                position INTEGER NOT NULL,
                item_id TEXT NOT NULL,
                PRIMARY KEY (learner, topic, position)
            );

            -- The item a learner is currently answering
            CREATE TABLE IF NOT EXISTS active_items (
                learner TEXT PRIMARY KEY,
                format TEXT NOT NULL,
                item_json TEXT NOT NULL,
                mode TEXT NOT NULL DEFAULT 'adaptive',
                served_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_attempts_cell ON attempts(learner, topic, format, recorded_at);
            CREATE INDEX IF NOT EXISTS idx_attempts_learner ON attempts(learner, recorded_at);
            "#,
        )?;

        // Run migrations for existing databases
        self.migrate()?;

        Ok(())
    }

    // Handle schema migrations for existing databases
    fn migrate(&self) -> Result<()> {
        let has_item_id: bool = self
            .conn
            .prepare("SELECT item_id FROM attempts LIMIT 1")
            .is_ok();

        if !has_item_id {
            self.conn
                .execute_batch("ALTER TABLE attempts ADD COLUMN item_id TEXT;")?;
        }

        let has_mode: bool = self
            .conn
            .prepare("SELECT mode FROM active_items LIMIT 1")
            .is_ok();

        if !has_mode {
            self.conn.execute_batch(
                "ALTER TABLE active_items ADD COLUMN mode TEXT NOT NULL DEFAULT 'adaptive';",
            )?;
        }

        Ok(())
    }

    // Attempt log operations
    pub fn record_attempt(&self, attempt: &NewAttempt<'_>) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO attempts (learner, topic, format, item_id, answer, outcome, feedback, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                attempt.learner,
                attempt.topic,
                attempt.format,
                attempt.item_id,
                attempt.answer,
                attempt.outcome,
                attempt.feedback,
                to_db_time(attempt.recorded_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn recent_attempts(
        &self,
        learner: &str,
        topic: Topic,
        format: Format,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Attempt>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM attempts
            WHERE learner = ?1 AND topic = ?2 AND format = ?3
              AND (?4 IS NULL OR recorded_at >= ?4)
            ORDER BY recorded_at DESC, id DESC
            LIMIT ?5
            "#,
            ATTEMPT_COLUMNS
        );
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let since = since.map(to_db_time);

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![learner, topic, format, since, limit],
            attempt_from_row,
        )?;
        rows.collect()
    }

    pub fn last_incorrect(&self, learner: &str, topic: Topic) -> Result<Option<String>> {
        self.conn
            .query_row(
                r#"
                SELECT answer FROM attempts
                WHERE learner = ?1 AND topic = ?2 AND outcome = 'incorrect' AND answer <> ''
                ORDER BY recorded_at DESC, id DESC
                LIMIT 1
                "#,
                params![learner, topic],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn history(&self, learner: &str, limit: usize) -> Result<Vec<Attempt>> {
        let sql = format!(
            "SELECT {} FROM attempts WHERE learner = ?1 ORDER BY recorded_at DESC, id DESC LIMIT ?2",
            ATTEMPT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![learner, limit as i64], attempt_from_row)?;
        rows.collect()
    }

    // Progression state operations
    pub fn load_state(&self, learner: &str) -> Result<Option<ProgressionState>> {
        let head = self
            .conn
            .query_row(
                r#"
                SELECT current_topic, current_format, format_attempt_count,
                       format_window_start, curriculum_complete
                FROM progression
                WHERE learner = ?1
                "#,
                params![learner],
                |row| {
                    Ok((
                        row.get::<_, Topic>(0)?,
                        row.get::<_, Format>(1)?,
                        row.get::<_, u32>(2)?,
                        from_db_time(3, row.get(3)?)?,
                        row.get::<_, i32>(4)? != 0,
                    ))
                },
            )
            .optional()?;

        let Some((topic, format, count, window_start, complete)) = head else {
            return Ok(None);
        };

        let mut state = ProgressionState::new(window_start);
        state.current_topic = topic;
        state.current_format = format;
        state.format_attempt_count = count;
        state.curriculum_complete = complete;
        state.completed.clear();

        let mut stmt = self
            .conn
            .prepare("SELECT topic, format FROM completed_cells WHERE learner = ?1")?;
        let cells = stmt.query_map(params![learner], |row| {
            Ok(Cell::new(row.get(0)?, row.get(1)?))
        })?;
        for cell in cells {
            state.completed.insert(cell?);
        }

        let mut stmt = self.conn.prepare(
            "SELECT topic, item_id FROM recent_items WHERE learner = ?1 ORDER BY topic, position",
        )?;
        let recent = stmt.query_map(params![learner], |row| {
            Ok((row.get::<_, Topic>(0)?, row.get::<_, String>(1)?))
        })?;
        for entry in recent {
            let (topic, item_id) = entry?;
            state.remember_item(topic, &item_id);
        }

        Ok(Some(state))
    }

    pub fn save_state(&self, learner: &str, state: &ProgressionState) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO progression (learner, current_topic, current_format, format_attempt_count,
                                     format_window_start, curriculum_complete, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(learner) DO UPDATE SET
                current_topic = excluded.current_topic,
                current_format = excluded.current_format,
                format_attempt_count = excluded.format_attempt_count,
                format_window_start = excluded.format_window_start,
                curriculum_complete = excluded.curriculum_complete,
                updated_at = excluded.updated_at
            "#,
            params![
                learner,
                state.current_topic,
                state.current_format,
                state.format_attempt_count,
                to_db_time(state.format_window_start),
                state.curriculum_complete as i32,
                to_db_time(Utc::now()),
            ],
        )?;

        tx.execute(
            "DELETE FROM completed_cells WHERE learner = ?1",
            params![learner],
        )?;
        for cell in &state.completed {
            tx.execute(
                "INSERT INTO completed_cells (learner, topic, format) VALUES (?1, ?2, ?3)",
                params![learner, cell.topic, cell.format],
            )?;
        }

        tx.execute("DELETE FROM recent_items WHERE learner = ?1", params![learner])?;
        for (topic, ids) in &state.recent_item_ids {
            for (position, item_id) in ids.iter().enumerate() {
                tx.execute(
                    "INSERT INTO recent_items (learner, topic, position, item_id) VALUES (?1, ?2, ?3, ?4)",
                    params![learner, topic, position as i64, item_id],
                )?;
            }
        }

        tx.commit()
    }

    // Attempts are kept; only the position in the curriculum is forgotten.
    pub fn delete_state(&self, learner: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()?;
        let rows = tx.execute("DELETE FROM progression WHERE learner = ?1", params![learner])?;
        tx.execute(
            "DELETE FROM completed_cells WHERE learner = ?1",
            params![learner],
        )?;
        tx.execute("DELETE FROM recent_items WHERE learner = ?1", params![learner])?;
        tx.execute("DELETE FROM active_items WHERE learner = ?1", params![learner])?;
        tx.commit()?;
        Ok(rows > 0)
    }

    // Active item operations
    pub fn set_active_item(
        &self,
        learner: &str,
        active: &ActiveItem,
        served_at: DateTime<Utc>,
    ) -> crate::error::Result<()> {
        let json = serde_json::to_string(&active.item)?;
        self.conn.execute(
            r#"
            INSERT INTO active_items (learner, format, item_json, mode, served_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(learner) DO UPDATE SET
                format = excluded.format,
                item_json = excluded.item_json,
                mode = excluded.mode,
                served_at = excluded.served_at
            "#,
            params![learner, active.format, json, active.mode, to_db_time(served_at)],
        )?;
        Ok(())
    }

    pub fn active_item(&self, learner: &str) -> crate::error::Result<Option<ActiveItem>> {
        let row = self
            .conn
            .query_row(
                "SELECT format, item_json, mode FROM active_items WHERE learner = ?1",
                params![learner],
                |row| {
                    Ok((
                        row.get::<_, Format>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Mode>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((format, json, mode)) => Ok(Some(ActiveItem {
                format,
                item: serde_json::from_str(&json)?,
                mode,
            })),
            None => Ok(None),
        }
    }

    pub fn clear_active_item(&self, learner: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM active_items WHERE learner = ?1", params![learner])?;
        Ok(())
    }

    // Statistics
    pub fn overall_stats(&self, learner: &str) -> Result<OverallStats> {
        let (total, correct, partial, incorrect): (u32, u32, u32, u32) = self.conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(outcome = 'correct'), 0),
                   COALESCE(SUM(outcome = 'partial'), 0),
                   COALESCE(SUM(outcome = 'incorrect'), 0)
            FROM attempts
            WHERE learner = ?1
            "#,
            params![learner],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(OverallStats {
            total,
            correct,
            partial,
            incorrect,
            accuracy: percent(correct, total),
        })
    }

    // Every cell of the grid, including ones never attempted.
    pub fn cell_stats(&self, learner: &str) -> Result<Vec<CellStats>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT topic, format, COUNT(*), COALESCE(SUM(outcome = 'correct'), 0)
            FROM attempts
            WHERE learner = ?1
            GROUP BY topic, format
            "#,
        )?;
        let rows = stmt.query_map(params![learner], |row| {
            Ok((
                Cell::new(row.get(0)?, row.get(1)?),
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
            ))
        })?;

        let mut counts: HashMap<Cell, (u32, u32)> = HashMap::new();
        for row in rows {
            let (cell, total, correct) = row?;
            counts.insert(cell, (total, correct));
        }

        Ok(Cell::all()
            .map(|cell| {
                let (total, correct) = counts.get(&cell).copied().unwrap_or((0, 0));
                CellStats {
                    topic: cell.topic,
                    format: cell.format,
                    total,
                    correct,
                    accuracy: percent(correct, total),
                }
            })
            .collect())
    }

    // Topics with enough attempts whose accuracy is below `below`, weakest first.
    pub fn weak_points(&self, learner: &str, min_attempts: u32, below: f64) -> Result<Vec<WeakPoint>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT topic, COUNT(*), COALESCE(SUM(outcome = 'correct'), 0)
            FROM attempts
            WHERE learner = ?1
            GROUP BY topic
            HAVING COUNT(*) >= ?2
            "#,
        )?;
        let rows = stmt.query_map(params![learner, min_attempts], |row| {
            let total: u32 = row.get(1)?;
            let correct: u32 = row.get(2)?;
            Ok(WeakPoint {
                topic: row.get(0)?,
                total,
                correct,
                accuracy: percent(correct, total),
            })
        })?;

        let mut weak = rows
            .filter(|r| r.as_ref().map_or(true, |w| w.accuracy < below))
            .collect::<Result<Vec<_>>>()?;
        weak.sort_by(|a, b| {
            a.accuracy
                .partial_cmp(&b.accuracy)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.topic.cmp(&b.topic))
        });
        Ok(weak)
    }
}

impl AttemptLog for Database {
    fn record(&self, attempt: &NewAttempt<'_>) -> crate::error::Result<i64> {
        Ok(self.record_attempt(attempt)?)
    }

    fn recent(
        &self,
        learner: &str,
        topic: Topic,
        format: Format,
        limit: Option<usize>,
        since: Option<DateTime<Utc>>,
    ) -> crate::error::Result<Vec<Attempt>> {
        Ok(self.recent_attempts(learner, topic, format, limit, since)?)
    }

    fn last_incorrect_answer(&self, learner: &str, topic: Topic) -> crate::error::Result<Option<String>> {
        Ok(self.last_incorrect(learner, topic)?)
    }
}

impl ProgressStore for Database {
    fn load(&self, learner: &str) -> crate::error::Result<Option<ProgressionState>> {
        Ok(self.load_state(learner)?)
    }

    fn save(&self, learner: &str, state: &ProgressionState) -> crate::error::Result<()> {
        Ok(self.save_state(learner, state)?)
    }
}
