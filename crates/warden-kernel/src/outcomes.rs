//! SQLite persistence for the bandit.
//!
//! Two tables: `arms` holds the live `(α, β)` pair per arm, `outcomes` is
//! the append-only history of rewards. A reward updates both inside one
//! transaction, so the counts can never drift from the history. Reads and
//! writes are single-writer; parallel episode runners use separate
//! database files.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use warden_core::bandit::ThompsonSampler;

/// Outcome-store failures.
#[derive(Debug, Error)]
pub enum OutcomeStoreError {
    /// Underlying SQLite failure.
    #[error("outcomes database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database directory could not be created.
    #[error("failed to create database directory: {0}")]
    CreateDir(#[from] std::io::Error),
}

/// One row of the outcome history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutcomeRow {
    /// Monotonic row id.
    pub seq: i64,
    /// Microseconds since the Unix epoch.
    pub ts: i64,
    /// Arm that produced the outcome.
    pub arm_id: String,
    /// Binary reward.
    pub reward: bool,
    /// Episode the reward came from.
    pub episode_id: String,
}

/// Aggregate per-arm view derived from the history.
#[derive(Clone, Debug, PartialEq)]
pub struct ArmRecord {
    /// Arm identifier.
    pub arm_id: String,
    /// Rewards observed.
    pub pulls: u64,
    /// Rewards equal to one.
    pub wins: u64,
    /// `wins / pulls`, zero when unpulled.
    pub win_rate: f64,
    /// Timestamp of the most recent outcome.
    pub last_ts: i64,
}

/// Single-writer handle over the outcomes database.
#[derive(Debug)]
pub struct OutcomeStore {
    conn: Connection,
}

impl OutcomeStore {
    /// Opens (creating if needed) the database and its schema.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeStoreError`] when the file or schema cannot be
    /// created.
    pub fn open(path: &Path) -> Result<Self, OutcomeStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeStoreError`] if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, OutcomeStoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS arms (
                arm_id TEXT PRIMARY KEY,
                alpha INTEGER NOT NULL,
                beta INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS outcomes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                arm_id TEXT NOT NULL,
                reward INTEGER NOT NULL,
                episode_id TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outcomes_arm ON outcomes(arm_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_outcomes_ts ON outcomes(ts)",
            [],
        )?;
        Ok(())
    }

    /// Records one reward: appends the outcome row and bumps the arm's
    /// Beta counts in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeStoreError`] on any SQLite failure; the
    /// transaction rolls back as a unit.
    pub fn record(
        &mut self,
        arm_id: &str,
        reward: bool,
        episode_id: &str,
        ts_micros: i64,
    ) -> Result<(), OutcomeStoreError> {
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO outcomes (ts, arm_id, reward, episode_id) VALUES (?1, ?2, ?3, ?4)",
            params![ts_micros, arm_id, i64::from(reward), episode_id],
        )?;

        let (d_alpha, d_beta) = if reward { (1i64, 0i64) } else { (0, 1) };
        tx.execute(
            "INSERT INTO arms (arm_id, alpha, beta, updated_at)
             VALUES (?1, 1 + ?2, 1 + ?3, ?4)
             ON CONFLICT(arm_id) DO UPDATE SET
                 alpha = alpha + ?2,
                 beta = beta + ?3,
                 updated_at = ?4",
            params![arm_id, d_alpha, d_beta, ts_micros],
        )?;

        tx.commit()?;
        debug!(arm_id, reward, episode_id, "outcome recorded");
        Ok(())
    }

    /// Warm-starts a sampler: registry arms at the prior, persisted arms
    /// restored to their stored counts.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeStoreError`] on a query failure.
    pub fn load_sampler<'a, I>(&self, registry: I) -> Result<ThompsonSampler, OutcomeStoreError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut sampler = ThompsonSampler::default();
        for arm_id in registry {
            sampler.ensure(arm_id);
        }

        let mut stmt = self.conn.prepare("SELECT arm_id, alpha, beta FROM arms")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (arm_id, alpha, beta) = row?;
            sampler.restore(
                &arm_id,
                u64::try_from(alpha).unwrap_or(1),
                u64::try_from(beta).unwrap_or(1),
            );
        }
        Ok(sampler)
    }

    /// Stored counts for one arm, if present.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeStoreError`] on a query failure.
    pub fn arm_counts(&self, arm_id: &str) -> Result<Option<(u64, u64)>, OutcomeStoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT alpha, beta FROM arms WHERE arm_id = ?1",
                params![arm_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        Ok(row.map(|(a, b)| (u64::try_from(a).unwrap_or(1), u64::try_from(b).unwrap_or(1))))
    }

    /// Per-arm leaderboard derived from the outcome history, best win
    /// rate first.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeStoreError`] on a query failure.
    pub fn arm_records(&self) -> Result<Vec<ArmRecord>, OutcomeStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT arm_id, COUNT(*), SUM(reward), MAX(ts)
             FROM outcomes GROUP BY arm_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (arm_id, pulls, wins, last_ts) = row?;
            let pulls = u64::try_from(pulls).unwrap_or(0);
            let wins = u64::try_from(wins.unwrap_or(0)).unwrap_or(0);
            #[allow(clippy::cast_precision_loss)]
            let win_rate = if pulls == 0 {
                0.0
            } else {
                wins as f64 / pulls as f64
            };
            records.push(ArmRecord {
                arm_id,
                pulls,
                wins,
                win_rate,
                last_ts: last_ts.unwrap_or(0),
            });
        }
        records.sort_by(|a, b| {
            b.win_rate
                .partial_cmp(&a.win_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(records)
    }

    /// Most recent outcomes, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`OutcomeStoreError`] on a query failure.
    pub fn recent(&self, limit: u32) -> Result<Vec<OutcomeRow>, OutcomeStoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, ts, arm_id, reward, episode_id
             FROM outcomes ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(OutcomeRow {
                seq: row.get(0)?,
                ts: row.get(1)?,
                arm_id: row.get(2)?,
                reward: row.get::<_, i64>(3)? != 0,
                episode_id: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
