//! SQLite store via `sqlx`.
//!
//! Rows keep the columns needed for filtering, ordering and conditional
//! updates; the full record is serialised into a JSON `body` column.
//! The global simulation row is fully columnar so that lock acquisition is
//! a single optimistic `UPDATE ... WHERE` statement.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use super::ArenaStore;
use crate::config::StoreConfig;
use crate::policy::PolicyVersion;
use crate::types::{
    Agent, ArenaError, Bid, ExceptionRecord, LeaderboardEntry, LedgerEntry, Memory, Partnership,
    QbrRecord, RoundSnapshot, Season, SimulationState, SimulationStatus, Task, TaskStatus,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS agents (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS policies (
        agent_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (agent_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        assigned_agent TEXT,
        created_round INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status, created_round)",
    "CREATE TABLE IF NOT EXISTS bids (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        task_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        round INTEGER NOT NULL,
        body TEXT NOT NULL,
        UNIQUE (task_id, agent_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_bids_round ON bids(round)",
    "CREATE TABLE IF NOT EXISTS ledger (
        round INTEGER NOT NULL,
        agent_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        reference TEXT NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (round, agent_id, kind, reference)
    )",
    "CREATE TABLE IF NOT EXISTS exceptions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        agent_id TEXT NOT NULL,
        resolved INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS qbr_records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        agent_id TEXT NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS partnerships (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        agent_a TEXT NOT NULL,
        agent_b TEXT NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS memories (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        agent_id TEXT,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS snapshots (
        round INTEGER NOT NULL,
        agent_id TEXT NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (round, agent_id)
    )",
    "CREATE TABLE IF NOT EXISTS seasons (
        id TEXT PRIMARY KEY,
        number INTEGER NOT NULL UNIQUE,
        body TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS leaderboards (
        season_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        rank INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (season_id, agent_id)
    )",
    "CREATE TABLE IF NOT EXISTS simulation_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        current_round INTEGER NOT NULL DEFAULT 0,
        last_completed_round INTEGER NOT NULL DEFAULT 0,
        lock_holder TEXT,
        lock_expires_at INTEGER,
        status TEXT NOT NULL DEFAULT 'IDLE',
        active_season TEXT,
        auto_run INTEGER NOT NULL DEFAULT 0,
        auto_run_interval_secs INTEGER NOT NULL DEFAULT 60
    )",
    "INSERT OR IGNORE INTO simulation_state (id) VALUES (1)",
];

fn to_body<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialise row body")
}

fn from_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).context("Failed to parse row body")
}

fn bodies<T: DeserializeOwned>(rows: Vec<(String,)>) -> Result<Vec<T>> {
    rows.iter().map(|(b,)| from_body(b)).collect()
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

type StateRow = (i64, i64, Option<String>, Option<i64>, String, Option<String>, i64, i64);

impl SqliteStore {
    /// Connect using the configured URL and create the schema.
    pub async fn connect(cfg: &StoreConfig) -> Result<Self> {
        let timeout = Duration::from_secs(cfg.query_timeout_secs);
        let options = SqliteConnectOptions::from_str(&cfg.database_url)
            .with_context(|| format!("Invalid database URL: {}", cfg.database_url))?
            .create_if_missing(true)
            .busy_timeout(timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_connections)
            .acquire_timeout(timeout)
            .connect_with(options)
            .await
            .context("Failed to open SQLite database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// A private in-memory database (single connection, never recycled).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema")?;
        }
        debug!("SQLite schema ready");
        Ok(())
    }
}

#[async_trait]
impl ArenaStore for SqliteStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let result = sqlx::query("INSERT INTO agents (id, body) VALUES (?, ?)")
            .bind(&agent.id)
            .bind(to_body(agent)?)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(ArenaError::Validation(format!("agent {} already exists", agent.id)).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(b,)| from_body(&b)).transpose()
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT body FROM agents ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        bodies(rows)
    }

    async fn save_agent(&self, agent: &Agent) -> Result<()> {
        let result = sqlx::query("UPDATE agents SET body = ? WHERE id = ?")
            .bind(to_body(agent)?)
            .bind(&agent.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ArenaError::AgentNotFound(agent.id.clone()).into());
        }
        Ok(())
    }

    async fn append_policy_version(&self, version: &PolicyVersion) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let (latest,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(version) FROM policies WHERE agent_id = ?")
                .bind(&version.agent_id)
                .fetch_one(&mut *tx)
                .await?;
        let expected = latest.unwrap_or(0) as u32 + 1;
        if version.version != expected {
            return Err(ArenaError::PolicyVersionConflict {
                agent_id: version.agent_id.clone(),
                expected,
                found: version.version,
            }
            .into());
        }
        sqlx::query("INSERT INTO policies (agent_id, version, body) VALUES (?, ?, ?)")
            .bind(&version.agent_id)
            .bind(version.version as i64)
            .bind(to_body(version)?)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn latest_policy(&self, agent_id: &str) -> Result<Option<PolicyVersion>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT body FROM policies WHERE agent_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(agent_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(b,)| from_body(&b)).transpose()
    }

    async fn policy_history(&self, agent_id: &str) -> Result<Vec<PolicyVersion>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM policies WHERE agent_id = ? ORDER BY version")
                .bind(agent_id)
                .fetch_all(&self.pool)
                .await?;
        bodies(rows)
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO tasks (id, status, assigned_agent, created_round, body)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(task.status.as_str())
        .bind(&task.assigned_agent)
        .bind(task.created_round as i64)
        .bind(to_body(task)?)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(ArenaError::Validation(format!("task {} already exists", task.id)).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(b,)| from_body(&b)).transpose()
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let result =
            sqlx::query("UPDATE tasks SET status = ?, assigned_agent = ?, body = ? WHERE id = ?")
                .bind(task.status.as_str())
                .bind(&task.assigned_agent)
                .bind(to_body(task)?)
                .bind(&task.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ArenaError::TaskNotFound(task.id.clone()).into());
        }
        Ok(())
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM tasks WHERE status = ? ORDER BY created_round, id")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        bodies(rows)
    }

    async fn pending_task_count(&self, agent_id: &str) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM tasks
             WHERE assigned_agent = ? AND status IN ('ASSIGNED', 'IN_PROGRESS')",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn insert_bids(&self, bids: &[Bid]) -> Result<Vec<Bid>> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(bids.len());
        for bid in bids {
            let result = sqlx::query(
                "INSERT INTO bids (id, task_id, agent_id, round, body) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&bid.id)
            .bind(&bid.task_id)
            .bind(&bid.agent_id)
            .bind(bid.round as i64)
            .bind(to_body(bid)?)
            .execute(&mut *tx)
            .await;
            match result {
                Ok(done) => {
                    let mut b = bid.clone();
                    b.sequence = done.last_insert_rowid() as u64;
                    stored.push(b);
                }
                Err(e) if is_unique_violation(&e) => {
                    return Err(ArenaError::Validation(format!(
                        "agent {} already bid on task {}",
                        bid.agent_id, bid.task_id
                    ))
                    .into());
                }
                Err(e) => return Err(e.into()),
            }
        }
        tx.commit().await?;
        Ok(stored)
    }

    async fn bids_for_task(&self, task_id: &str) -> Result<Vec<Bid>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT seq, body FROM bids WHERE task_id = ? ORDER BY seq")
                .bind(task_id)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(seq, body)| {
                let mut bid: Bid = from_body(&body)?;
                bid.sequence = seq as u64;
                Ok(bid)
            })
            .collect()
    }

    async fn bids_for_round(&self, round: u64) -> Result<Vec<Bid>> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT seq, body FROM bids WHERE round = ? ORDER BY seq")
                .bind(round as i64)
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|(seq, body)| {
                let mut bid: Bid = from_body(&body)?;
                bid.sequence = seq as u64;
                Ok(bid)
            })
            .collect()
    }

    async fn commit_resolution(&self, task: &Task, bids: &[Bid]) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let claimed = sqlx::query(
            "UPDATE tasks SET status = ?, assigned_agent = ?, body = ?
             WHERE id = ? AND status = 'OPEN'",
        )
        .bind(task.status.as_str())
        .bind(&task.assigned_agent)
        .bind(to_body(task)?)
        .bind(&task.id)
        .execute(&mut *tx)
        .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        for bid in bids {
            sqlx::query("UPDATE bids SET body = ? WHERE id = ?")
                .bind(to_body(bid)?)
                .bind(&bid.id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn commit_ledger_entry(&self, entry: &LedgerEntry, agent: &Agent) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO ledger (round, agent_id, kind, reference, body) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(entry.round as i64)
        .bind(&entry.agent_id)
        .bind(entry.kind.as_str())
        .bind(&entry.reference)
        .bind(to_body(entry)?)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        let updated = sqlx::query("UPDATE agents SET body = ? WHERE id = ?")
            .bind(to_body(agent)?)
            .bind(&agent.id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(ArenaError::AgentNotFound(agent.id.clone()).into());
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn ledger_for_agent(&self, agent_id: &str) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM ledger WHERE agent_id = ? ORDER BY rowid")
                .bind(agent_id)
                .fetch_all(&self.pool)
                .await?;
        bodies(rows)
    }

    async fn ledger_for_round(&self, round: u64) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM ledger WHERE round = ? ORDER BY rowid")
                .bind(round as i64)
                .fetch_all(&self.pool)
                .await?;
        bodies(rows)
    }

    async fn insert_exception(&self, record: &ExceptionRecord) -> Result<()> {
        sqlx::query("INSERT INTO exceptions (id, agent_id, resolved, body) VALUES (?, ?, ?, ?)")
            .bind(&record.id)
            .bind(&record.agent_id)
            .bind(record.resolved)
            .bind(to_body(record)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_exception(&self, record: &ExceptionRecord) -> Result<()> {
        let result = sqlx::query("UPDATE exceptions SET resolved = ?, body = ? WHERE id = ?")
            .bind(record.resolved)
            .bind(to_body(record)?)
            .bind(&record.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("exception {} not found", record.id);
        }
        Ok(())
    }

    async fn open_exceptions(&self, agent_id: Option<&str>) -> Result<Vec<ExceptionRecord>> {
        let rows: Vec<(String,)> = match agent_id {
            Some(id) => {
                sqlx::query_as(
                    "SELECT body FROM exceptions WHERE resolved = 0 AND agent_id = ? ORDER BY seq",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as("SELECT body FROM exceptions WHERE resolved = 0 ORDER BY seq")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        bodies(rows)
    }

    async fn recent_exceptions(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<ExceptionRecord>> {
        let rows: Vec<(String,)> =
            sqlx::query_as(
                "SELECT body FROM exceptions WHERE agent_id = ? ORDER BY seq DESC LIMIT ?",
            )
            .bind(agent_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        bodies(rows)
    }

    async fn insert_qbr(&self, record: &QbrRecord) -> Result<()> {
        sqlx::query("INSERT INTO qbr_records (id, agent_id, body) VALUES (?, ?, ?)")
            .bind(&record.id)
            .bind(&record.agent_id)
            .bind(to_body(record)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn qbr_history(&self, agent_id: &str, limit: usize) -> Result<Vec<QbrRecord>> {
        let rows: Vec<(String,)> =
            sqlx::query_as(
                "SELECT body FROM qbr_records WHERE agent_id = ? ORDER BY seq DESC LIMIT ?",
            )
            .bind(agent_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        bodies(rows)
    }

    async fn insert_partnership(&self, partnership: &Partnership) -> Result<()> {
        sqlx::query("INSERT INTO partnerships (id, agent_a, agent_b, body) VALUES (?, ?, ?, ?)")
            .bind(&partnership.id)
            .bind(&partnership.agent_a)
            .bind(&partnership.agent_b)
            .bind(to_body(partnership)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_partnership(&self, partnership: &Partnership) -> Result<()> {
        let result = sqlx::query("UPDATE partnerships SET body = ? WHERE id = ?")
            .bind(to_body(partnership)?)
            .bind(&partnership.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ArenaError::Partnership(format!(
                "partnership {} not found",
                partnership.id
            ))
            .into());
        }
        Ok(())
    }

    async fn partnerships_for_agent(&self, agent_id: &str) -> Result<Vec<Partnership>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT body FROM partnerships WHERE agent_a = ?1 OR agent_b = ?1 ORDER BY seq",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        bodies(rows)
    }

    async fn insert_memory(&self, memory: &Memory) -> Result<()> {
        sqlx::query("INSERT INTO memories (id, agent_id, body) VALUES (?, ?, ?)")
            .bind(&memory.id)
            .bind(&memory.agent_id)
            .bind(to_body(memory)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn memories_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM memories WHERE agent_id = ? ORDER BY seq DESC LIMIT ?")
                .bind(agent_id)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;
        bodies(rows)
    }

    async fn market_memories(&self, limit: usize) -> Result<Vec<Memory>> {
        let rows: Vec<(String,)> =
            sqlx::query_as(
                "SELECT body FROM memories WHERE agent_id IS NULL ORDER BY seq DESC LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        bodies(rows)
    }

    async fn save_snapshots(&self, snapshots: &[RoundSnapshot]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for s in snapshots {
            sqlx::query(
                "INSERT INTO snapshots (round, agent_id, body) VALUES (?, ?, ?)
                 ON CONFLICT (round, agent_id) DO UPDATE SET body = excluded.body",
            )
            .bind(s.round as i64)
            .bind(&s.agent_id)
            .bind(to_body(s)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn snapshots_between(&self, from: u64, to: u64) -> Result<Vec<RoundSnapshot>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT body FROM snapshots WHERE round >= ? AND round <= ? ORDER BY round, agent_id",
        )
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await?;
        bodies(rows)
    }

    async fn snapshots_for_agent(
        &self,
        agent_id: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RoundSnapshot>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT body FROM snapshots
             WHERE agent_id = ? AND round >= ? AND round <= ? ORDER BY round",
        )
        .bind(agent_id)
        .bind(from as i64)
        .bind(to as i64)
        .fetch_all(&self.pool)
        .await?;
        bodies(rows)
    }

    async fn insert_season(&self, season: &Season) -> Result<()> {
        let result = sqlx::query("INSERT INTO seasons (id, number, body) VALUES (?, ?, ?)")
            .bind(&season.id)
            .bind(season.number as i64)
            .bind(to_body(season)?)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                let msg = format!("season {} already exists", season.number);
                Err(ArenaError::Validation(msg).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save_season(&self, season: &Season) -> Result<()> {
        let result = sqlx::query("UPDATE seasons SET body = ? WHERE id = ?")
            .bind(to_body(season)?)
            .bind(&season.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("season {} not found", season.id);
        }
        Ok(())
    }

    async fn get_season(&self, id: &str) -> Result<Option<Season>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM seasons WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(b,)| from_body(&b)).transpose()
    }

    async fn season_by_number(&self, number: u32) -> Result<Option<Season>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT body FROM seasons WHERE number = ?")
            .bind(number as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(b,)| from_body(&b)).transpose()
    }

    async fn latest_season(&self) -> Result<Option<Season>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT body FROM seasons ORDER BY number DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(b,)| from_body(&b)).transpose()
    }

    async fn save_leaderboard(&self, season_id: &str, entries: &[LeaderboardEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM leaderboards WHERE season_id = ?")
            .bind(season_id)
            .execute(&mut *tx)
            .await?;
        for e in entries {
            sqlx::query(
                "INSERT INTO leaderboards (season_id, agent_id, rank, body) VALUES (?, ?, ?, ?)",
            )
            .bind(season_id)
            .bind(&e.agent_id)
            .bind(e.rank as i64)
            .bind(to_body(e)?)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn leaderboard(&self, season_id: &str) -> Result<Vec<LeaderboardEntry>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT body FROM leaderboards WHERE season_id = ? ORDER BY rank")
                .bind(season_id)
                .fetch_all(&self.pool)
                .await?;
        bodies(rows)
    }

    async fn load_state(&self) -> Result<SimulationState> {
        let row: StateRow = sqlx::query_as(
            "SELECT current_round, last_completed_round, lock_holder, lock_expires_at, status,
                    active_season, auto_run, auto_run_interval_secs
             FROM simulation_state WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        let (current, completed, holder, expires, status, season, auto_run, interval) = row;
        Ok(SimulationState {
            current_round: current as u64,
            last_completed_round: completed as u64,
            lock_holder: holder,
            lock_expires_at: expires.and_then(DateTime::<Utc>::from_timestamp_millis),
            status: if status == "RUNNING" {
                SimulationStatus::Running
            } else {
                SimulationStatus::Idle
            },
            active_season: season,
            auto_run: auto_run != 0,
            auto_run_interval_secs: interval as u64,
        })
    }

    async fn save_state(&self, state: &SimulationState) -> Result<()> {
        sqlx::query(
            "UPDATE simulation_state
             SET current_round = ?, last_completed_round = ?, active_season = ?,
                 auto_run = ?, auto_run_interval_secs = ?
             WHERE id = 1",
        )
        .bind(state.current_round as i64)
        .bind(state.last_completed_round as i64)
        .bind(&state.active_season)
        .bind(state.auto_run)
        .bind(state.auto_run_interval_secs as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE simulation_state
             SET lock_holder = ?1, lock_expires_at = ?2, status = 'RUNNING'
             WHERE id = 1
               AND (lock_holder IS NULL OR lock_holder = ?1
                    OR lock_expires_at IS NULL OR lock_expires_at <= ?3)",
        )
        .bind(holder)
        .bind(expires_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, holder: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE simulation_state
             SET lock_holder = NULL, lock_expires_at = NULL, status = 'IDLE'
             WHERE id = 1 AND lock_holder = ?",
        )
        .bind(holder)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn clear_round_history(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["tasks", "bids", "ledger", "exceptions", "qbr_records", "snapshots"] {
            sqlx::query(&format!("DELETE FROM {table}")).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
