//! Persistence layer.
//!
//! The engine talks to storage only through [`ArenaStore`]: read, write,
//! filter, order and limit, plus two conditional writes that carry the
//! concurrency guarantees (task resolution claims and the round lock).
//! [`memory::MemoryStore`] backs tests and single-process runs;
//! [`sqlite::SqliteStore`] persists to SQLite through `sqlx`.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::StoreConfig;
use crate::policy::PolicyVersion;
use crate::types::{
    Agent, Bid, ExceptionRecord, LeaderboardEntry, LedgerEntry, Memory, Partnership, QbrRecord,
    RoundSnapshot, Season, SimulationState, Task, TaskStatus,
};

/// Relational read/write contract consumed by the engine.
#[async_trait]
pub trait ArenaStore: Send + Sync {
    // -- Agents -------------------------------------------------------------

    /// Insert a new agent. Fails if the id already exists.
    async fn insert_agent(&self, agent: &Agent) -> Result<()>;
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;
    /// All agents ordered by id.
    async fn list_agents(&self) -> Result<Vec<Agent>>;
    async fn save_agent(&self, agent: &Agent) -> Result<()>;

    // -- Policies -----------------------------------------------------------

    /// Append a policy version. The version must be exactly latest + 1,
    /// otherwise `ArenaError::PolicyVersionConflict` is returned.
    async fn append_policy_version(&self, version: &PolicyVersion) -> Result<()>;
    async fn latest_policy(&self, agent_id: &str) -> Result<Option<PolicyVersion>>;
    /// Full history ordered by version ascending.
    async fn policy_history(&self, agent_id: &str) -> Result<Vec<PolicyVersion>>;

    // -- Tasks --------------------------------------------------------------

    async fn insert_task(&self, task: &Task) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn save_task(&self, task: &Task) -> Result<()>;
    /// Tasks in `status`, ordered by creation round then id.
    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    /// Number of ASSIGNED or IN_PROGRESS tasks held by an agent.
    async fn pending_task_count(&self, agent_id: &str) -> Result<usize>;

    // -- Bids ---------------------------------------------------------------

    /// Insert a batch of PENDING bids, assigning submission sequence numbers.
    /// All-or-nothing: a duplicate (agent, task) pair rejects the batch.
    async fn insert_bids(&self, bids: &[Bid]) -> Result<Vec<Bid>>;
    /// Bids on a task ordered by sequence.
    async fn bids_for_task(&self, task_id: &str) -> Result<Vec<Bid>>;
    async fn bids_for_round(&self, round: u64) -> Result<Vec<Bid>>;
    /// Atomically write a resolved task and its bids, but only if the stored
    /// task is still OPEN. Returns false when another resolution got there first.
    async fn commit_resolution(&self, task: &Task, bids: &[Bid]) -> Result<bool>;

    // -- Ledger -------------------------------------------------------------

    /// Record a ledger entry and write the already-updated agent in one step.
    /// Returns false (and writes nothing) if the entry key was already recorded.
    async fn commit_ledger_entry(&self, entry: &LedgerEntry, agent: &Agent) -> Result<bool>;
    async fn ledger_for_agent(&self, agent_id: &str) -> Result<Vec<LedgerEntry>>;
    async fn ledger_for_round(&self, round: u64) -> Result<Vec<LedgerEntry>>;

    // -- Exceptions & reviews -----------------------------------------------

    async fn insert_exception(&self, record: &ExceptionRecord) -> Result<()>;
    async fn save_exception(&self, record: &ExceptionRecord) -> Result<()>;
    /// Unresolved exceptions, optionally for one agent, oldest first.
    async fn open_exceptions(&self, agent_id: Option<&str>) -> Result<Vec<ExceptionRecord>>;
    /// Most recent exceptions for an agent, newest first.
    async fn recent_exceptions(&self, agent_id: &str, limit: usize) -> Result<Vec<ExceptionRecord>>;
    async fn insert_qbr(&self, record: &QbrRecord) -> Result<()>;
    /// Newest first.
    async fn qbr_history(&self, agent_id: &str, limit: usize) -> Result<Vec<QbrRecord>>;

    // -- Partnerships -------------------------------------------------------

    async fn insert_partnership(&self, partnership: &Partnership) -> Result<()>;
    async fn save_partnership(&self, partnership: &Partnership) -> Result<()>;
    /// Every partnership either agent is party to, oldest first.
    async fn partnerships_for_agent(&self, agent_id: &str) -> Result<Vec<Partnership>>;

    // -- Memories -----------------------------------------------------------

    async fn insert_memory(&self, memory: &Memory) -> Result<()>;
    /// Agent memories, newest first.
    async fn memories_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Memory>>;
    /// Market-wide memories, newest first.
    async fn market_memories(&self, limit: usize) -> Result<Vec<Memory>>;

    // -- Snapshots & seasons ------------------------------------------------

    /// Upsert snapshots keyed by (round, agent).
    async fn save_snapshots(&self, snapshots: &[RoundSnapshot]) -> Result<()>;
    /// Snapshots with `from <= round <= to`, ordered by round then agent.
    async fn snapshots_between(&self, from: u64, to: u64) -> Result<Vec<RoundSnapshot>>;
    async fn snapshots_for_agent(
        &self,
        agent_id: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RoundSnapshot>>;
    async fn insert_season(&self, season: &Season) -> Result<()>;
    async fn save_season(&self, season: &Season) -> Result<()>;
    async fn get_season(&self, id: &str) -> Result<Option<Season>>;
    async fn season_by_number(&self, number: u32) -> Result<Option<Season>>;
    /// Highest-numbered season.
    async fn latest_season(&self) -> Result<Option<Season>>;
    /// Replace the leaderboard of a season.
    async fn save_leaderboard(&self, season_id: &str, entries: &[LeaderboardEntry]) -> Result<()>;
    /// Ordered by rank.
    async fn leaderboard(&self, season_id: &str) -> Result<Vec<LeaderboardEntry>>;

    // -- Simulation state ---------------------------------------------------

    /// The global simulation row (initialised to defaults on first read).
    async fn load_state(&self) -> Result<SimulationState>;
    /// Persist round counters, season pointer and auto-run settings.
    /// Lock fields are only written by `try_acquire_lock` / `release_lock`.
    async fn save_state(&self, state: &SimulationState) -> Result<()>;
    /// Conditional update: take the lock if it is free, already ours, or expired.
    async fn try_acquire_lock(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Clear the lock if `holder` owns it.
    async fn release_lock(&self, holder: &str) -> Result<bool>;
    /// Delete round-keyed history (tasks, bids, ledger, exceptions, reviews,
    /// snapshots) so round numbers can start over. Agents, policies,
    /// partnerships, memories and finished seasons are kept.
    async fn clear_round_history(&self) -> Result<()>;
}

/// Shared handle used across services.
pub type SharedStore = Arc<dyn ArenaStore>;

/// Open the store described by the configuration.
pub async fn open_store(cfg: &StoreConfig) -> Result<SharedStore> {
    if cfg.database_url == "memory" {
        info!("Using in-memory store");
        return Ok(Arc::new(memory::MemoryStore::new()));
    }
    let store = sqlite::SqliteStore::connect(cfg).await?;
    info!(url = %cfg.database_url, "Using SQLite store");
    Ok(Arc::new(store))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Contract checks shared by every store implementation.
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::policy::{Policy, TriggerKind, TriggerMeta};
    use crate::types::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn agent(id: &str) -> Agent {
        let mut a = Agent::new(id, id.to_uppercase(), AgentType::Catalog, Personality::Balanced);
        a.balance = dec!(0.10);
        a.status = AgentStatus::Active;
        a
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.to_string(),
            task_type: AgentType::Catalog,
            status: TaskStatus::Open,
            max_bid: dec!(0.02),
            created_round: 1,
            deadline_round: 3,
            assigned_agent: None,
            winning_bid: None,
            winning_amount: None,
            completed_round: None,
            created_at: Utc::now(),
        }
    }

    fn bid(task_id: &str, agent_id: &str, amount: Decimal) -> Bid {
        Bid::new(
            task_id,
            agent_id,
            1,
            amount,
            PolicySnapshot {
                source: PolicySource::Policy,
                policy_version: 1,
                margin: dec!(0.2),
                cost_basis: dec!(0.004),
                survival_mode: None,
            },
        )
    }

    fn version(agent_id: &str, v: u32) -> crate::policy::PolicyVersion {
        crate::policy::PolicyVersion {
            agent_id: agent_id.to_string(),
            version: v,
            policy: Policy::from_personality(Personality::Balanced),
            reasoning: format!("reason {v}"),
            trigger: TriggerMeta {
                kind: TriggerKind::Registration,
                reference: None,
                detail: None,
            },
            round: 0,
            created_at: Utc::now(),
        }
    }

    pub async fn agents_roundtrip(store: &dyn ArenaStore) {
        store.insert_agent(&agent("b")).await.unwrap();
        store.insert_agent(&agent("a")).await.unwrap();
        assert!(store.insert_agent(&agent("a")).await.is_err());

        let mut a = store.get_agent("a").await.unwrap().unwrap();
        a.reputation = 4.2;
        store.save_agent(&a).await.unwrap();

        let all = store.list_agents().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert!((all[0].reputation - 4.2).abs() < 1e-9);
        assert!(store.get_agent("zzz").await.unwrap().is_none());
    }

    pub async fn policy_versions_are_sequential(store: &dyn ArenaStore) {
        store.insert_agent(&agent("p")).await.unwrap();
        store.append_policy_version(&version("p", 1)).await.unwrap();
        store.append_policy_version(&version("p", 2)).await.unwrap();

        let skipped = store.append_policy_version(&version("p", 4)).await.unwrap_err();
        assert!(matches!(
            skipped.downcast_ref::<ArenaError>(),
            Some(ArenaError::PolicyVersionConflict { expected: 3, found: 4, .. })
        ));
        assert!(store.append_policy_version(&version("p", 2)).await.is_err());

        let latest = store.latest_policy("p").await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.reasoning, "reason 2");
        let history = store.policy_history("p").await.unwrap();
        assert_eq!(history.iter().map(|v| v.version).collect::<Vec<_>>(), vec![1, 2]);
    }

    pub async fn bids_and_resolution(store: &dyn ArenaStore) {
        store.insert_task(&task("t1")).await.unwrap();
        let stored = store
            .insert_bids(&[bid("t1", "a", dec!(0.006)), bid("t1", "b", dec!(0.008))])
            .await
            .unwrap();
        assert!(stored[0].sequence < stored[1].sequence);

        // Duplicate (agent, task) rejects the whole batch.
        let dup = store
            .insert_bids(&[bid("t1", "c", dec!(0.007)), bid("t1", "a", dec!(0.005))])
            .await;
        assert!(dup.is_err());
        assert_eq!(store.bids_for_task("t1").await.unwrap().len(), 2);

        let mut t = store.get_task("t1").await.unwrap().unwrap();
        t.status = TaskStatus::Assigned;
        t.assigned_agent = Some("a".into());
        let mut bids = store.bids_for_task("t1").await.unwrap();
        bids[0].status = BidStatus::Accepted;
        bids[1].status = BidStatus::Rejected;

        assert!(store.commit_resolution(&t, &bids).await.unwrap());
        // Second commit sees a non-OPEN task.
        assert!(!store.commit_resolution(&t, &bids).await.unwrap());

        let bids = store.bids_for_task("t1").await.unwrap();
        assert_eq!(bids.iter().filter(|b| b.status == BidStatus::Accepted).count(), 1);
        assert_eq!(store.tasks_with_status(TaskStatus::Assigned).await.unwrap().len(), 1);
        assert_eq!(store.pending_task_count("a").await.unwrap(), 1);
        assert_eq!(store.bids_for_round(1).await.unwrap().len(), 2);
    }

    pub async fn ledger_is_idempotent(store: &dyn ArenaStore) {
        let mut a = agent("l");
        store.insert_agent(&a).await.unwrap();
        let entry = LedgerEntry::new(3, "l", LedgerKind::LivingCost, "round", dec!(-0.0005));
        a.apply_balance_delta(entry.amount);
        assert!(store.commit_ledger_entry(&entry, &a).await.unwrap());

        let mut again = a.clone();
        again.apply_balance_delta(entry.amount);
        assert!(!store.commit_ledger_entry(&entry, &again).await.unwrap());

        let stored = store.get_agent("l").await.unwrap().unwrap();
        assert_eq!(stored.balance, dec!(0.0995));
        assert_eq!(store.ledger_for_agent("l").await.unwrap().len(), 1);
        assert_eq!(store.ledger_for_round(3).await.unwrap().len(), 1);
    }

    pub async fn lock_semantics(store: &dyn ArenaStore) {
        let t0 = Utc::now();
        let ttl = chrono::Duration::seconds(30);
        assert!(store.try_acquire_lock("x", t0, t0 + ttl).await.unwrap());
        let t10 = t0 + chrono::Duration::seconds(10);
        assert!(!store.try_acquire_lock("y", t10, t10 + ttl).await.unwrap());
        let t35 = t0 + chrono::Duration::seconds(35);
        assert!(store.try_acquire_lock("y", t35, t35 + ttl).await.unwrap());

        let state = store.load_state().await.unwrap();
        assert_eq!(state.lock_holder.as_deref(), Some("y"));
        assert_eq!(state.status, SimulationStatus::Running);

        assert!(!store.release_lock("x").await.unwrap());
        assert!(store.release_lock("y").await.unwrap());
        let state = store.load_state().await.unwrap();
        assert!(state.lock_holder.is_none());
        assert_eq!(state.status, SimulationStatus::Idle);
    }

    pub async fn state_save_keeps_lock(store: &dyn ArenaStore) {
        let now = Utc::now();
        assert!(store
            .try_acquire_lock("x", now, now + chrono::Duration::seconds(30))
            .await
            .unwrap());
        let mut state = SimulationState::default();
        state.current_round = 7;
        state.active_season = Some("s1".into());
        store.save_state(&state).await.unwrap();

        let loaded = store.load_state().await.unwrap();
        assert_eq!(loaded.current_round, 7);
        assert_eq!(loaded.active_season.as_deref(), Some("s1"));
        assert_eq!(loaded.lock_holder.as_deref(), Some("x"));
    }

    pub async fn memories_newest_first(store: &dyn ArenaStore) {
        for (i, kind) in [MemoryKind::Observation, MemoryKind::Learning, MemoryKind::Market]
            .into_iter()
            .enumerate()
        {
            store
                .insert_memory(&Memory {
                    id: format!("m{i}"),
                    agent_id: if kind == MemoryKind::Market { None } else { Some("a".into()) },
                    kind,
                    content: format!("memory {i}"),
                    round: i as u64,
                    importance: 0.5,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let mine = store.memories_for_agent("a", 10).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].id, "m1");
        let market = store.market_memories(10).await.unwrap();
        assert_eq!(market.len(), 1);
        assert_eq!(market[0].kind, MemoryKind::Market);
    }

    pub async fn snapshots_and_seasons(store: &dyn ArenaStore) {
        let snap = |round: u64, agent_id: &str, balance: Decimal| RoundSnapshot {
            round,
            agent_id: agent_id.to_string(),
            balance,
            reputation: 3.0,
            status: AgentStatus::Active,
            won: 0,
            lost: 0,
        };
        store
            .save_snapshots(&[
                snap(1, "a", dec!(0.1)),
                snap(1, "b", dec!(0.1)),
                snap(2, "a", dec!(0.2)),
            ])
            .await
            .unwrap();
        // Upsert replaces the (round, agent) row.
        store.save_snapshots(&[snap(2, "a", dec!(0.3))]).await.unwrap();
        let all = store.snapshots_between(1, 2).await.unwrap();
        assert_eq!(all.len(), 3);
        let mine = store.snapshots_for_agent("a", 2, 2).await.unwrap();
        assert_eq!(mine[0].balance, dec!(0.3));

        let season = Season {
            id: "s1".into(),
            number: 1,
            start_round: 1,
            length: 2,
            end_round: None,
            status: SeasonStatus::Active,
            champion: None,
            created_at: Utc::now(),
        };
        store.insert_season(&season).await.unwrap();
        assert_eq!(store.latest_season().await.unwrap().unwrap().id, "s1");
        assert_eq!(store.season_by_number(1).await.unwrap().unwrap().id, "s1");

        let entry = |agent_id: &str, rank: u32| LeaderboardEntry {
            season_id: "s1".into(),
            agent_id: agent_id.into(),
            rank,
            score: 10.0 / rank as f64,
            balance_delta: Decimal::ZERO,
            win_rate: 0.0,
            reputation_delta: 0.0,
            champion: rank == 1,
        };
        store.save_leaderboard("s1", &[entry("b", 2), entry("a", 1)]).await.unwrap();
        let board = store.leaderboard("s1").await.unwrap();
        assert_eq!(board[0].agent_id, "a");
        assert!(board[0].champion);
    }

    pub async fn clearing_history_keeps_agents(store: &dyn ArenaStore) {
        let mut a = agent("h");
        store.insert_agent(&a).await.unwrap();
        store.insert_task(&task("t-h")).await.unwrap();
        let entry = LedgerEntry::new(1, "h", LedgerKind::LivingCost, "living", dec!(-0.0005));
        a.apply_balance_delta(entry.amount);
        assert!(store.commit_ledger_entry(&entry, &a).await.unwrap());

        store.clear_round_history().await.unwrap();
        assert!(store.get_task("t-h").await.unwrap().is_none());
        assert!(store.ledger_for_round(1).await.unwrap().is_empty());
        assert!(store.get_agent("h").await.unwrap().is_some());
        // The same ledger key applies again after a clear.
        assert!(store.commit_ledger_entry(&entry, &a).await.unwrap());
    }
}
