//! In-memory store.
//!
//! All tables live behind one async mutex, so every trait method is atomic
//! with respect to every other. That is what makes `commit_resolution` and
//! `try_acquire_lock` safe under concurrent callers.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

use super::ArenaStore;
use crate::policy::PolicyVersion;
use crate::types::{
    Agent, ArenaError, Bid, ExceptionRecord, LeaderboardEntry, LedgerEntry, LedgerKind, Memory,
    Partnership, QbrRecord, RoundSnapshot, Season, SimulationState, SimulationStatus, Task,
    TaskStatus,
};

type LedgerKey = (u64, String, LedgerKind, String);

#[derive(Default)]
struct Tables {
    agents: BTreeMap<String, Agent>,
    policies: HashMap<String, Vec<PolicyVersion>>,
    tasks: HashMap<String, Task>,
    /// Insertion order is submission order.
    bids: Vec<Bid>,
    next_bid_seq: u64,
    ledger: Vec<LedgerEntry>,
    ledger_keys: HashSet<LedgerKey>,
    exceptions: Vec<ExceptionRecord>,
    qbr: Vec<QbrRecord>,
    partnerships: Vec<Partnership>,
    memories: Vec<Memory>,
    snapshots: BTreeMap<(u64, String), RoundSnapshot>,
    seasons: Vec<Season>,
    leaderboards: HashMap<String, Vec<LeaderboardEntry>>,
    state: SimulationState,
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArenaStore for MemoryStore {
    async fn insert_agent(&self, agent: &Agent) -> Result<()> {
        let mut t = self.inner.lock().await;
        if t.agents.contains_key(&agent.id) {
            return Err(ArenaError::Validation(format!("agent {} already exists", agent.id)).into());
        }
        t.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.inner.lock().await.agents.get(id).cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.inner.lock().await.agents.values().cloned().collect())
    }

    async fn save_agent(&self, agent: &Agent) -> Result<()> {
        let mut t = self.inner.lock().await;
        match t.agents.get_mut(&agent.id) {
            Some(slot) => {
                *slot = agent.clone();
                Ok(())
            }
            None => Err(ArenaError::AgentNotFound(agent.id.clone()).into()),
        }
    }

    async fn append_policy_version(&self, version: &PolicyVersion) -> Result<()> {
        let mut t = self.inner.lock().await;
        let history = t.policies.entry(version.agent_id.clone()).or_default();
        let expected = history.last().map(|v| v.version).unwrap_or(0) + 1;
        if version.version != expected {
            return Err(ArenaError::PolicyVersionConflict {
                agent_id: version.agent_id.clone(),
                expected,
                found: version.version,
            }
            .into());
        }
        history.push(version.clone());
        Ok(())
    }

    async fn latest_policy(&self, agent_id: &str) -> Result<Option<PolicyVersion>> {
        let t = self.inner.lock().await;
        Ok(t.policies.get(agent_id).and_then(|h| h.last().cloned()))
    }

    async fn policy_history(&self, agent_id: &str) -> Result<Vec<PolicyVersion>> {
        let t = self.inner.lock().await;
        Ok(t.policies.get(agent_id).cloned().unwrap_or_default())
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut t = self.inner.lock().await;
        if t.tasks.contains_key(&task.id) {
            return Err(ArenaError::Validation(format!("task {} already exists", task.id)).into());
        }
        t.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.inner.lock().await.tasks.get(id).cloned())
    }

    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut t = self.inner.lock().await;
        match t.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(ArenaError::TaskNotFound(task.id.clone()).into()),
        }
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        let t = self.inner.lock().await;
        let mut tasks: Vec<Task> = t
            .tasks
            .values()
            .filter(|x| x.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_round.cmp(&b.created_round).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn pending_task_count(&self, agent_id: &str) -> Result<usize> {
        let t = self.inner.lock().await;
        Ok(t.tasks
            .values()
            .filter(|x| x.assigned_agent.as_deref() == Some(agent_id))
            .filter(|x| matches!(x.status, TaskStatus::Assigned | TaskStatus::InProgress))
            .count())
    }

    async fn insert_bids(&self, bids: &[Bid]) -> Result<Vec<Bid>> {
        let mut t = self.inner.lock().await;
        let mut seen: HashSet<(&str, &str)> = t
            .bids
            .iter()
            .map(|b| (b.agent_id.as_str(), b.task_id.as_str()))
            .collect();
        for bid in bids {
            if !seen.insert((bid.agent_id.as_str(), bid.task_id.as_str())) {
                return Err(ArenaError::Validation(format!(
                    "agent {} already bid on task {}",
                    bid.agent_id, bid.task_id
                ))
                .into());
            }
        }
        drop(seen);

        let mut stored = Vec::with_capacity(bids.len());
        for bid in bids {
            t.next_bid_seq += 1;
            let mut b = bid.clone();
            b.sequence = t.next_bid_seq;
            t.bids.push(b.clone());
            stored.push(b);
        }
        Ok(stored)
    }

    async fn bids_for_task(&self, task_id: &str) -> Result<Vec<Bid>> {
        let t = self.inner.lock().await;
        Ok(t.bids.iter().filter(|b| b.task_id == task_id).cloned().collect())
    }

    async fn bids_for_round(&self, round: u64) -> Result<Vec<Bid>> {
        let t = self.inner.lock().await;
        Ok(t.bids.iter().filter(|b| b.round == round).cloned().collect())
    }

    async fn commit_resolution(&self, task: &Task, bids: &[Bid]) -> Result<bool> {
        let mut t = self.inner.lock().await;
        let current = t
            .tasks
            .get(&task.id)
            .ok_or_else(|| ArenaError::TaskNotFound(task.id.clone()))?;
        if current.status != TaskStatus::Open {
            return Ok(false);
        }
        t.tasks.insert(task.id.clone(), task.clone());
        let updates: HashMap<&str, &Bid> = bids.iter().map(|b| (b.id.as_str(), b)).collect();
        for stored in t.bids.iter_mut() {
            if let Some(updated) = updates.get(stored.id.as_str()) {
                stored.status = updated.status;
            }
        }
        Ok(true)
    }

    async fn commit_ledger_entry(&self, entry: &LedgerEntry, agent: &Agent) -> Result<bool> {
        let mut t = self.inner.lock().await;
        if !t.agents.contains_key(&agent.id) {
            return Err(ArenaError::AgentNotFound(agent.id.clone()).into());
        }
        if !t.ledger_keys.insert(entry.key()) {
            return Ok(false);
        }
        t.ledger.push(entry.clone());
        t.agents.insert(agent.id.clone(), agent.clone());
        Ok(true)
    }

    async fn ledger_for_agent(&self, agent_id: &str) -> Result<Vec<LedgerEntry>> {
        let t = self.inner.lock().await;
        Ok(t.ledger.iter().filter(|e| e.agent_id == agent_id).cloned().collect())
    }

    async fn ledger_for_round(&self, round: u64) -> Result<Vec<LedgerEntry>> {
        let t = self.inner.lock().await;
        Ok(t.ledger.iter().filter(|e| e.round == round).cloned().collect())
    }

    async fn insert_exception(&self, record: &ExceptionRecord) -> Result<()> {
        self.inner.lock().await.exceptions.push(record.clone());
        Ok(())
    }

    async fn save_exception(&self, record: &ExceptionRecord) -> Result<()> {
        let mut t = self.inner.lock().await;
        let slot = t
            .exceptions
            .iter_mut()
            .find(|e| e.id == record.id)
            .ok_or_else(|| anyhow!("exception {} not found", record.id))?;
        *slot = record.clone();
        Ok(())
    }

    async fn open_exceptions(&self, agent_id: Option<&str>) -> Result<Vec<ExceptionRecord>> {
        let t = self.inner.lock().await;
        Ok(t.exceptions
            .iter()
            .filter(|e| !e.resolved)
            .filter(|e| agent_id.map_or(true, |id| e.agent_id == id))
            .cloned()
            .collect())
    }

    async fn recent_exceptions(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<ExceptionRecord>> {
        let t = self.inner.lock().await;
        Ok(t.exceptions
            .iter()
            .rev()
            .filter(|e| e.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_qbr(&self, record: &QbrRecord) -> Result<()> {
        self.inner.lock().await.qbr.push(record.clone());
        Ok(())
    }

    async fn qbr_history(&self, agent_id: &str, limit: usize) -> Result<Vec<QbrRecord>> {
        let t = self.inner.lock().await;
        Ok(t.qbr
            .iter()
            .rev()
            .filter(|q| q.agent_id == agent_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn insert_partnership(&self, partnership: &Partnership) -> Result<()> {
        self.inner.lock().await.partnerships.push(partnership.clone());
        Ok(())
    }

    async fn save_partnership(&self, partnership: &Partnership) -> Result<()> {
        let mut t = self.inner.lock().await;
        let slot = t
            .partnerships
            .iter_mut()
            .find(|p| p.id == partnership.id)
            .ok_or_else(|| {
                ArenaError::Partnership(format!("partnership {} not found", partnership.id))
            })?;
        *slot = partnership.clone();
        Ok(())
    }

    async fn partnerships_for_agent(&self, agent_id: &str) -> Result<Vec<Partnership>> {
        let t = self.inner.lock().await;
        Ok(t.partnerships.iter().filter(|p| p.involves(agent_id)).cloned().collect())
    }

    async fn insert_memory(&self, memory: &Memory) -> Result<()> {
        self.inner.lock().await.memories.push(memory.clone());
        Ok(())
    }

    async fn memories_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let t = self.inner.lock().await;
        Ok(t.memories
            .iter()
            .rev()
            .filter(|m| m.agent_id.as_deref() == Some(agent_id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn market_memories(&self, limit: usize) -> Result<Vec<Memory>> {
        let t = self.inner.lock().await;
        Ok(t.memories
            .iter()
            .rev()
            .filter(|m| m.agent_id.is_none())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn save_snapshots(&self, snapshots: &[RoundSnapshot]) -> Result<()> {
        let mut t = self.inner.lock().await;
        for s in snapshots {
            t.snapshots.insert((s.round, s.agent_id.clone()), s.clone());
        }
        Ok(())
    }

    async fn snapshots_between(&self, from: u64, to: u64) -> Result<Vec<RoundSnapshot>> {
        let t = self.inner.lock().await;
        Ok(t.snapshots
            .values()
            .filter(|s| s.round >= from && s.round <= to)
            .cloned()
            .collect())
    }

    async fn snapshots_for_agent(
        &self,
        agent_id: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<RoundSnapshot>> {
        let t = self.inner.lock().await;
        Ok(t.snapshots
            .values()
            .filter(|s| s.agent_id == agent_id && s.round >= from && s.round <= to)
            .cloned()
            .collect())
    }

    async fn insert_season(&self, season: &Season) -> Result<()> {
        let mut t = self.inner.lock().await;
        if t.seasons.iter().any(|s| s.number == season.number) {
            return Err(ArenaError::Validation(format!(
                "season {} already exists",
                season.number
            ))
            .into());
        }
        t.seasons.push(season.clone());
        Ok(())
    }

    async fn save_season(&self, season: &Season) -> Result<()> {
        let mut t = self.inner.lock().await;
        let slot = t
            .seasons
            .iter_mut()
            .find(|s| s.id == season.id)
            .ok_or_else(|| anyhow!("season {} not found", season.id))?;
        *slot = season.clone();
        Ok(())
    }

    async fn get_season(&self, id: &str) -> Result<Option<Season>> {
        let t = self.inner.lock().await;
        Ok(t.seasons.iter().find(|s| s.id == id).cloned())
    }

    async fn season_by_number(&self, number: u32) -> Result<Option<Season>> {
        let t = self.inner.lock().await;
        Ok(t.seasons.iter().find(|s| s.number == number).cloned())
    }

    async fn latest_season(&self) -> Result<Option<Season>> {
        let t = self.inner.lock().await;
        Ok(t.seasons.iter().max_by_key(|s| s.number).cloned())
    }

    async fn save_leaderboard(&self, season_id: &str, entries: &[LeaderboardEntry]) -> Result<()> {
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|e| e.rank);
        self.inner.lock().await.leaderboards.insert(season_id.to_string(), sorted);
        Ok(())
    }

    async fn leaderboard(&self, season_id: &str) -> Result<Vec<LeaderboardEntry>> {
        let t = self.inner.lock().await;
        Ok(t.leaderboards.get(season_id).cloned().unwrap_or_default())
    }

    async fn load_state(&self) -> Result<SimulationState> {
        Ok(self.inner.lock().await.state.clone())
    }

    async fn save_state(&self, state: &SimulationState) -> Result<()> {
        let mut t = self.inner.lock().await;
        let lock_holder = t.state.lock_holder.take();
        let lock_expires_at = t.state.lock_expires_at;
        let status = t.state.status;
        t.state = SimulationState {
            lock_holder,
            lock_expires_at,
            status,
            ..state.clone()
        };
        Ok(())
    }

    async fn try_acquire_lock(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut t = self.inner.lock().await;
        if !t.state.lock_available(holder, now) {
            return Ok(false);
        }
        t.state.lock_holder = Some(holder.to_string());
        t.state.lock_expires_at = Some(expires_at);
        t.state.status = SimulationStatus::Running;
        Ok(true)
    }

    async fn release_lock(&self, holder: &str) -> Result<bool> {
        let mut t = self.inner.lock().await;
        if t.state.lock_holder.as_deref() != Some(holder) {
            return Ok(false);
        }
        t.state.lock_holder = None;
        t.state.lock_expires_at = None;
        t.state.status = SimulationStatus::Idle;
        Ok(true)
    }

    async fn clear_round_history(&self) -> Result<()> {
        let mut t = self.inner.lock().await;
        t.tasks.clear();
        t.bids.clear();
        t.ledger.clear();
        t.ledger_keys.clear();
        t.exceptions.clear();
        t.qbr.clear();
        t.snapshots.clear();
        Ok(())
    }
}
