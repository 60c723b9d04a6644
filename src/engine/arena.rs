//! Arena — the round lock, the season lifecycle and the round trigger.
//!
//! Rounds are single-writer: every mutation of the simulation happens
//! while holding the TTL lock in the simulation state row. An expired lock
//! can be reclaimed by anyone, so a crashed scheduler never wedges the
//! arena. Seasons are fixed-length runs of rounds; when the last round of a
//! season has been snapshotted the season is scored, its champion named and
//! the next round opens a new one.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::auction::AuctionService;
use super::economy::EconomyService;
use super::exceptions::ExceptionDetector;
use super::round::{round_snapshots, RoundParams, RoundProcessor, RoundResult};
use crate::brain::{DecisionModel, DecisionOutcome, PolicyDecisionEngine, Trigger, Wakeup};
use crate::chain::ChainCache;
use crate::config::{AgentSeed, AppConfig, ArenaConfig};
use crate::memory::MemoryService;
use crate::policy::{Policy, PolicyVersion, TriggerKind, TriggerMeta};
use crate::storage::SharedStore;
use crate::types::{
    Agent, AgentStatus, ArenaError, LeaderboardEntry, RoundSnapshot, Season, SeasonStatus,
};

/// Upper bound on rounds per trigger call.
pub const MAX_ROUNDS_PER_RUN: u32 = 100;

const BALANCE_WEIGHT: f64 = 0.4;
const WIN_RATE_WEIGHT: f64 = 0.3;
const REPUTATION_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LockOutcome {
    Acquired { expires_at: DateTime<Utc> },
    Busy { holder: String, expires_at: Option<DateTime<Utc>> },
}

/// Round-trigger request. Missing fields fall back to the arena config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub tasks_per_round: Option<usize>,
    #[serde(default)]
    pub rounds: Option<u32>,
    #[serde(default)]
    pub min_price: Option<Decimal>,
    #[serde(default)]
    pub max_price: Option<Decimal>,
    #[serde(default)]
    pub agent_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeasonSummary {
    pub season_id: String,
    pub number: u32,
    pub champion: Option<String>,
    pub leaderboard: Vec<LeaderboardEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub season: u32,
    #[serde(flatten)]
    pub result: RoundResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalized_season: Option<SeasonSummary>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { rounds: Vec<RoundReport> },
    Busy { holder: String, expires_at: Option<DateTime<Utc>> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResumeOutcome {
    Resumed { resumed: usize },
    Busy { holder: String, expires_at: Option<DateTime<Utc>> },
}

/// Composite season score.
pub fn season_score(balance_delta: Decimal, win_rate: f64, reputation_delta: f64) -> f64 {
    BALANCE_WEIGHT * balance_delta.to_f64().unwrap_or(0.0)
        + WIN_RATE_WEIGHT * (win_rate * 100.0)
        + REPUTATION_WEIGHT * (reputation_delta * 20.0)
}

pub struct ArenaService {
    store: SharedStore,
    economy: Arc<EconomyService>,
    brain: Arc<PolicyDecisionEngine>,
    memory: Arc<MemoryService>,
    processor: RoundProcessor,
    chain: Option<Arc<ChainCache>>,
    cfg: ArenaConfig,
    initial_balance: Decimal,
}

impl ArenaService {
    pub fn new(store: SharedStore, config: &AppConfig, model: Arc<dyn DecisionModel>) -> Self {
        let economy = Arc::new(EconomyService::new(store.clone(), config.economy.clone()));
        let detector = Arc::new(ExceptionDetector::new(store.clone(), config.exceptions.clone()));
        let memory = Arc::new(MemoryService::new(store.clone()));
        let brain = Arc::new(PolicyDecisionEngine::new(
            store.clone(),
            economy.clone(),
            detector.clone(),
            memory.clone(),
            model,
            config.auction.clone(),
            config.brain.clone(),
        ));
        let auction = AuctionService::new(store.clone(), economy.clone(), config.auction.clone());
        let processor = RoundProcessor::new(
            store.clone(),
            economy.clone(),
            auction,
            detector,
            brain.clone(),
            memory.clone(),
            config.arena.task_deadline_rounds,
        );
        Self {
            store,
            economy,
            brain,
            memory,
            processor,
            chain: None,
            cfg: config.arena.clone(),
            initial_balance: config.economy.initial_balance,
        }
    }

    /// Refresh this cache from the registry after every round.
    pub fn with_chain(mut self, chain: Arc<ChainCache>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.cfg
    }

    pub fn chain(&self) -> Option<&Arc<ChainCache>> {
        self.chain.as_ref()
    }

    pub fn brain(&self) -> &Arc<PolicyDecisionEngine> {
        &self.brain
    }

    // -----------------------------------------------------------------------
    // Lock
    // -----------------------------------------------------------------------

    pub async fn acquire_lock(&self, holder: &str) -> Result<LockOutcome> {
        self.acquire_lock_at(holder, Utc::now()).await
    }

    /// Take (or extend) the round lock as of `now`.
    pub async fn acquire_lock_at(&self, holder: &str, now: DateTime<Utc>) -> Result<LockOutcome> {
        let expires_at = now + Duration::seconds(self.cfg.lock_ttl_secs);
        if self.store.try_acquire_lock(holder, now, expires_at).await? {
            debug!(holder, expires_at = %expires_at, "Round lock acquired");
            return Ok(LockOutcome::Acquired { expires_at });
        }
        let state = self.store.load_state().await?;
        let current = state.lock_holder.unwrap_or_default();
        info!(holder, current_holder = %current, "Round lock busy");
        Ok(LockOutcome::Busy {
            holder: current,
            expires_at: state.lock_expires_at,
        })
    }

    pub async fn release_lock(&self, holder: &str) -> Result<bool> {
        let released = self.store.release_lock(holder).await?;
        if !released {
            warn!(holder, "Lock was not held by this holder at release");
        }
        Ok(released)
    }

    // -----------------------------------------------------------------------
    // Seasons
    // -----------------------------------------------------------------------

    /// The active season, or a new one starting at `next_round`.
    pub async fn ensure_active_season(&self, next_round: u64) -> Result<Season> {
        let mut state = self.store.load_state().await?;
        if let Some(id) = &state.active_season {
            if let Some(season) = self.store.get_season(id).await? {
                if season.status == SeasonStatus::Active {
                    return Ok(season);
                }
            }
        }

        let number = self.store.latest_season().await?.map(|s| s.number + 1).unwrap_or(1);
        let season = Season {
            id: uuid::Uuid::new_v4().to_string(),
            number,
            start_round: next_round,
            length: self.cfg.season_length,
            end_round: None,
            status: SeasonStatus::Active,
            champion: None,
            created_at: Utc::now(),
        };
        self.store.insert_season(&season).await?;
        // Baseline for the season's deltas.
        self.save_round_snapshot(next_round.saturating_sub(1)).await?;
        state.active_season = Some(season.id.clone());
        self.store.save_state(&state).await?;
        info!(season = number, start_round = next_round, length = season.length, "Season opened");
        Ok(season)
    }

    /// Whether `round` completes the season.
    pub fn is_season_boundary(season: &Season, round: u64) -> bool {
        season.rounds_completed(round) >= season.length
    }

    /// Score every agent over the season, persist the leaderboard, name the
    /// champion and close the season.
    pub async fn finalize_season(&self, season: &Season, round: u64) -> Result<SeasonSummary> {
        let baseline_round = season.start_round.saturating_sub(1);
        let snapshots = self.store.snapshots_between(baseline_round, round).await?;

        let mut by_agent: BTreeMap<&str, Vec<&RoundSnapshot>> = BTreeMap::new();
        for snap in &snapshots {
            by_agent.entry(snap.agent_id.as_str()).or_default().push(snap);
        }

        let mut entries: Vec<LeaderboardEntry> = by_agent
            .into_iter()
            .filter_map(|(agent_id, mut snaps)| {
                snaps.sort_by_key(|s| s.round);
                let first = *snaps.first()?;
                let last = *snaps.last()?;
                let (won, lost) = snaps
                    .iter()
                    .filter(|s| s.round >= season.start_round)
                    .fold((0u32, 0u32), |(w, l), s| (w + s.won, l + s.lost));
                let win_rate = if won + lost > 0 { won as f64 / (won + lost) as f64 } else { 0.0 };
                let balance_delta = last.balance - first.balance;
                let reputation_delta = last.reputation - first.reputation;
                Some(LeaderboardEntry {
                    season_id: season.id.clone(),
                    agent_id: agent_id.to_string(),
                    rank: 0,
                    score: season_score(balance_delta, win_rate, reputation_delta),
                    balance_delta,
                    win_rate,
                    reputation_delta,
                    champion: false,
                })
            })
            .collect();

        entries.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        for (idx, entry) in entries.iter_mut().enumerate() {
            entry.rank = idx as u32 + 1;
            entry.champion = idx == 0;
        }
        let champion = entries.first().map(|e| e.agent_id.clone());
        self.store.save_leaderboard(&season.id, &entries).await?;

        let mut closed = season.clone();
        closed.status = SeasonStatus::Completed;
        closed.end_round = Some(round);
        closed.champion = champion.clone();
        self.store.save_season(&closed).await?;

        let mut state = self.store.load_state().await?;
        if state.active_season.as_deref() == Some(season.id.as_str()) {
            state.active_season = None;
            self.store.save_state(&state).await?;
        }

        let note = match &champion {
            Some(id) => format!(
                "Season {} ended after round {round}; champion {id}",
                season.number
            ),
            None => format!("Season {} ended after round {round} with no entrants", season.number),
        };
        if let Err(e) = self.memory.record_market(note, round).await {
            warn!(season = season.number, error = %e, "Could not record season memory");
        }

        info!(
            season = season.number,
            round,
            champion = ?champion,
            entrants = entries.len(),
            "Season finalized"
        );
        Ok(SeasonSummary {
            season_id: season.id.clone(),
            number: season.number,
            champion,
            leaderboard: entries,
        })
    }

    pub async fn active_season(&self) -> Result<Option<Season>> {
        let state = self.store.load_state().await?;
        match state.active_season {
            Some(id) => self.store.get_season(&id).await,
            None => Ok(None),
        }
    }

    pub async fn save_round_snapshot(&self, round: u64) -> Result<Vec<RoundSnapshot>> {
        let snapshots = round_snapshots(&self.store, round).await?;
        self.store.save_snapshots(&snapshots).await?;
        Ok(snapshots)
    }

    // -----------------------------------------------------------------------
    // Round trigger
    // -----------------------------------------------------------------------

    fn params_for(&self, request: &RunRequest) -> Result<RoundParams> {
        let mut params = RoundParams::from_config(&self.cfg);
        if let Some(n) = request.tasks_per_round {
            params.tasks_per_round = n;
        }
        if let Some(p) = request.min_price {
            params.min_price = p;
        }
        if let Some(p) = request.max_price {
            params.max_price = p;
        }
        if params.min_price <= Decimal::ZERO || params.min_price > params.max_price {
            return Err(ArenaError::Validation(format!(
                "invalid price bounds {}..{}",
                params.min_price, params.max_price
            ))
            .into());
        }
        params.agent_ids = request.agent_ids.clone();
        Ok(params)
    }

    /// Run the next round under the lock.
    pub async fn run_round(&self, holder: &str, params: &RoundParams) -> Result<RunOutcome> {
        if let LockOutcome::Busy { holder, expires_at } = self.acquire_lock(holder).await? {
            return Ok(RunOutcome::Busy { holder, expires_at });
        }
        let played = self.play_round(params).await;
        self.release_lock(holder).await?;
        Ok(RunOutcome::Completed { rounds: vec![played?] })
    }

    /// Run `request.rounds` consecutive rounds under one lock.
    pub async fn run_rounds(&self, holder: &str, request: &RunRequest) -> Result<RunOutcome> {
        let count = request.rounds.unwrap_or(1);
        if count == 0 || count > MAX_ROUNDS_PER_RUN {
            return Err(ArenaError::Validation(format!(
                "rounds must be between 1 and {MAX_ROUNDS_PER_RUN}, got {count}"
            ))
            .into());
        }
        let params = self.params_for(request)?;

        if let LockOutcome::Busy { holder, expires_at } = self.acquire_lock(holder).await? {
            return Ok(RunOutcome::Busy { holder, expires_at });
        }

        let mut reports = Vec::with_capacity(count as usize);
        let mut failure = None;
        for _ in 0..count {
            // Extend the lock before each round; stop once another holder has it.
            match self.acquire_lock(holder).await {
                Ok(LockOutcome::Acquired { .. }) => {}
                Ok(LockOutcome::Busy { holder: current, .. }) => {
                    warn!(
                        holder,
                        %current,
                        completed = reports.len(),
                        "Round lock lost, stopping run"
                    );
                    failure = Some(anyhow::Error::from(ArenaError::LockLost {
                        holder: holder.to_string(),
                        current,
                    }));
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            match self.play_round(&params).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        self.release_lock(holder).await?;

        if let Some(e) = failure {
            return Err(e.context(format!(
                "run stopped after {} completed round(s)",
                reports.len()
            )));
        }
        Ok(RunOutcome::Completed { rounds: reports })
    }

    /// One round; the caller holds the lock.
    async fn play_round(&self, params: &RoundParams) -> Result<RoundReport> {
        let state = self.store.load_state().await?;
        let round = state.last_completed_round + 1;
        let season = self.ensure_active_season(round).await?;

        let mut state = self.store.load_state().await?;
        state.current_round = round;
        self.store.save_state(&state).await?;

        let result = self
            .processor
            .process(round, params)
            .await
            .with_context(|| format!("round {round} failed"))?;
        self.save_round_snapshot(round).await?;

        let mut state = self.store.load_state().await?;
        state.last_completed_round = round;
        self.store.save_state(&state).await?;

        let finalized_season = if Self::is_season_boundary(&season, round) {
            Some(self.finalize_season(&season, round).await?)
        } else {
            None
        };

        if let Some(chain) = &self.chain {
            let ids: Vec<String> = self
                .store
                .list_agents()
                .await?
                .into_iter()
                .map(|a| a.id)
                .collect();
            chain.refresh(&ids).await;
        }

        Ok(RoundReport {
            season: season.number,
            result,
            finalized_season,
        })
    }

    // -----------------------------------------------------------------------
    // Reset and roster
    // -----------------------------------------------------------------------

    /// Start the round counter over. Every non-DEAD agent is PAUSED and the
    /// season pointer is cleared; an unfinished season is closed without a
    /// champion.
    pub async fn reset(&self, holder: &str) -> Result<LockOutcome> {
        let lock = self.acquire_lock(holder).await?;
        if matches!(lock, LockOutcome::Busy { .. }) {
            return Ok(lock);
        }
        let outcome = self.reset_locked().await;
        self.release_lock(holder).await?;
        outcome?;
        Ok(lock)
    }

    async fn reset_locked(&self) -> Result<()> {
        let mut state = self.store.load_state().await?;
        if let Some(mut season) = self.active_season().await? {
            season.status = SeasonStatus::Completed;
            season.end_round = Some(state.last_completed_round);
            self.store.save_season(&season).await?;
        }
        self.store.clear_round_history().await?;

        let mut paused = 0;
        for agent in self.store.list_agents().await? {
            if agent.is_dead() {
                continue;
            }
            let interval = self
                .brain
                .current_policy(&agent)
                .await?
                .qbr_schedule()
                .base_frequency_rounds;
            self.economy
                .amend(&agent.id, |a| {
                    a.status = AgentStatus::Paused;
                    a.next_qbr_round = interval;
                    a.stable_rounds = 0;
                })
                .await?;
            paused += 1;
        }

        state.current_round = 0;
        state.last_completed_round = 0;
        state.active_season = None;
        self.store.save_state(&state).await?;
        info!(paused, "Arena reset");
        Ok(())
    }

    /// Return every PAUSED agent to bidding, under the round lock.
    pub async fn resume_agents(&self, holder: &str) -> Result<ResumeOutcome> {
        if let LockOutcome::Busy { holder, expires_at } = self.acquire_lock(holder).await? {
            return Ok(ResumeOutcome::Busy { holder, expires_at });
        }
        let resumed = self.resume_locked().await;
        self.release_lock(holder).await?;
        Ok(ResumeOutcome::Resumed { resumed: resumed? })
    }

    async fn resume_locked(&self) -> Result<usize> {
        let mut resumed = 0;
        for agent in self.store.list_agents().await? {
            if agent.status != AgentStatus::Paused {
                continue;
            }
            self.economy.amend(&agent.id, |a| a.status = AgentStatus::Active).await?;
            self.economy.recompute_status(&agent.id).await?;
            resumed += 1;
        }
        info!(resumed, "Agents resumed");
        Ok(resumed)
    }

    /// Persist a new agent with its personality policy as version 1, fund
    /// it, and run its initial setup decision.
    pub async fn register_agent(&self, seed: &AgentSeed) -> Result<(Agent, DecisionOutcome)> {
        if self.store.get_agent(&seed.id).await?.is_some() {
            return Err(
                ArenaError::Validation(format!("agent {} is already registered", seed.id)).into(),
            );
        }
        let round = self.store.load_state().await?.last_completed_round;
        let policy = Policy::from_personality(seed.personality);

        let mut agent = Agent::new(&seed.id, &seed.name, seed.agent_type, seed.personality);
        agent.skill = seed.skill;
        agent.policy_version = 1;
        agent.next_qbr_round = round + policy.qbr_schedule().base_frequency_rounds;
        self.store.insert_agent(&agent).await?;

        self.store
            .append_policy_version(&PolicyVersion {
                agent_id: agent.id.clone(),
                version: 1,
                policy,
                reasoning: format!("Initial {} policy", seed.personality),
                trigger: TriggerMeta {
                    kind: TriggerKind::Registration,
                    reference: None,
                    detail: None,
                },
                round,
                created_at: Utc::now(),
            })
            .await?;

        let amount = seed.initial_balance.unwrap_or(self.initial_balance);
        if amount > Decimal::ZERO {
            self.economy.fund_agent(round, &agent.id, amount, "registration").await?;
        }
        info!(
            agent_id = %agent.id,
            agent_type = %agent.agent_type,
            personality = %agent.personality,
            balance = %amount,
            "Agent registered"
        );

        let setup = self.brain.wake(&Wakeup::new(&agent.id, Trigger::InitialSetup), round).await;
        let agent = self
            .store
            .get_agent(&agent.id)
            .await?
            .ok_or_else(|| ArenaError::AgentNotFound(seed.id.clone()))?;
        Ok((agent, setup))
    }

    /// Register every roster entry not yet in the store.
    pub async fn seed_roster(&self, roster: &[AgentSeed]) -> Result<usize> {
        let mut added = 0;
        for seed in roster {
            if self.store.get_agent(&seed.id).await?.is_some() {
                continue;
            }
            self.register_agent(seed).await?;
            added += 1;
        }
        if added > 0 {
            info!(added, "Roster seeded");
        }
        Ok(added)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::rules::RuleBasedModel;
    use crate::storage::memory::MemoryStore;
    use crate::chain::{ChainRecord, GroundTruth};
    use crate::storage::ArenaStore;
    use crate::types::{AgentType, Personality, SkillTier, SimulationStatus};
    use rust_decimal_macros::dec;

    fn arena(cfg: AppConfig) -> (Arc<MemoryStore>, ArenaService) {
        let store = Arc::new(MemoryStore::new());
        let service = ArenaService::new(store.clone(), &cfg, Arc::new(RuleBasedModel::new()));
        (store, service)
    }

    fn seed(id: &str, agent_type: AgentType, personality: Personality) -> AgentSeed {
        AgentSeed {
            id: id.into(),
            name: id.to_uppercase(),
            agent_type,
            personality,
            skill: SkillTier::Standard,
            initial_balance: None,
        }
    }

    fn snap(
        round: u64,
        agent_id: &str,
        balance: Decimal,
        reputation: f64,
        won: u32,
        lost: u32,
    ) -> RoundSnapshot {
        RoundSnapshot {
            round,
            agent_id: agent_id.into(),
            balance,
            reputation,
            status: AgentStatus::Active,
            won,
            lost,
        }
    }

    #[tokio::test]
    async fn test_lock_contention_and_expiry() {
        let (_, arena) = arena(AppConfig::default());
        let t0 = Utc::now();
        assert!(matches!(
            arena.acquire_lock_at("x", t0).await.unwrap(),
            LockOutcome::Acquired { .. }
        ));

        let busy = arena.acquire_lock_at("y", t0 + Duration::seconds(10)).await.unwrap();
        assert_eq!(
            busy,
            LockOutcome::Busy {
                holder: "x".into(),
                expires_at: Some(t0 + Duration::seconds(30)),
            }
        );
        assert!(matches!(
            arena.acquire_lock_at("y", t0 + Duration::seconds(35)).await.unwrap(),
            LockOutcome::Acquired { .. }
        ));
    }

    #[tokio::test]
    async fn test_register_agent_writes_version_one_and_funds() {
        let (store, arena) = arena(AppConfig::default());
        let (agent, setup) = arena
            .register_agent(&seed("a1", AgentType::Review, Personality::Conservative))
            .await
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.balance, dec!(0.10));
        assert_eq!(agent.policy_version, 1);
        assert_eq!(agent.next_qbr_round, 10);
        assert_eq!(setup.trigger, TriggerKind::InitialSetup);
        assert!(setup.new_policy_version.is_none());

        let v1 = store.latest_policy("a1").await.unwrap().unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v1.trigger.kind, TriggerKind::Registration);
        assert!(arena
            .register_agent(&seed("a1", AgentType::Review, Personality::Balanced))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_run_rounds_advances_counter_and_releases_lock() {
        let (store, arena) = arena(AppConfig::default());
        arena.seed_roster(&[
            seed("a1", AgentType::Catalog, Personality::Aggressive),
            seed("a2", AgentType::Catalog, Personality::Balanced),
        ])
        .await
        .unwrap();

        let request = RunRequest {
            rounds: Some(3),
            tasks_per_round: Some(4),
            ..RunRequest::default()
        };
        let RunOutcome::Completed { rounds } = arena.run_rounds("tester", &request).await.unwrap()
        else {
            panic!("expected completed run");
        };
        assert_eq!(rounds.iter().map(|r| r.result.round).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(rounds.iter().all(|r| r.season == 1));

        let state = store.load_state().await.unwrap();
        assert_eq!(state.last_completed_round, 3);
        assert!(state.lock_holder.is_none());
        assert_eq!(state.status, SimulationStatus::Idle);
        assert_eq!(store.snapshots_for_agent("a1", 1, 3).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_run_rejected_while_lock_held() {
        let (_, arena) = arena(AppConfig::default());
        arena.acquire_lock("other").await.unwrap();
        let outcome = arena.run_rounds("tester", &RunRequest::default()).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Busy { ref holder, .. } if holder == "other"));
    }

    /// Registry stub that takes the round lock for another holder.
    struct LockThief {
        store: SharedStore,
    }

    #[async_trait::async_trait]
    impl GroundTruth for LockThief {
        async fn fetch(&self, _agent_id: &str) -> Result<ChainRecord> {
            // Far enough ahead that the scheduler's lock has expired.
            let later = Utc::now() + Duration::seconds(60);
            self.store
                .try_acquire_lock("intruder", later, later + Duration::seconds(60))
                .await?;
            anyhow::bail!("registry offline")
        }
    }

    #[tokio::test]
    async fn test_run_stops_when_lock_is_taken_over() {
        let (store, arena) = arena(AppConfig::default());
        let thief = Arc::new(LockThief { store: store.clone() });
        let arena = arena.with_chain(Arc::new(ChainCache::new(thief, 0)));
        arena.seed_roster(&[seed("a1", AgentType::Catalog, Personality::Balanced)]).await.unwrap();

        let request = RunRequest {
            rounds: Some(3),
            ..RunRequest::default()
        };
        let err = arena.run_rounds("sched", &request).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ArenaError>(),
            Some(ArenaError::LockLost { current, .. }) if current == "intruder"
        ));

        let state = store.load_state().await.unwrap();
        assert_eq!(state.last_completed_round, 1);
        assert_eq!(state.lock_holder.as_deref(), Some("intruder"));
    }

    #[tokio::test]
    async fn test_run_request_validation() {
        let (_, arena) = arena(AppConfig::default());
        let too_many = RunRequest {
            rounds: Some(MAX_ROUNDS_PER_RUN + 1),
            ..RunRequest::default()
        };
        assert!(arena.run_rounds("t", &too_many).await.is_err());
        let inverted = RunRequest {
            min_price: Some(dec!(0.05)),
            max_price: Some(dec!(0.01)),
            ..RunRequest::default()
        };
        assert!(arena.run_rounds("t", &inverted).await.is_err());
    }

    #[tokio::test]
    async fn test_season_boundary_and_finalize() {
        let mut cfg = AppConfig::default();
        cfg.arena.season_length = 50;
        let (store, arena) = arena(cfg);
        let mut state = store.load_state().await.unwrap();
        state.last_completed_round = 100;
        store.save_state(&state).await.unwrap();

        let season = arena.ensure_active_season(101).await.unwrap();
        assert_eq!(season.start_round, 101);
        assert!(!ArenaService::is_season_boundary(&season, 149));
        assert!(ArenaService::is_season_boundary(&season, 150));

        store
            .save_snapshots(&[
                snap(100, "a", dec!(0.10), 3.0, 0, 0),
                snap(100, "b", dec!(0.10), 3.0, 0, 0),
                snap(125, "a", dec!(0.12), 3.2, 3, 1),
                snap(150, "a", dec!(0.15), 3.5, 2, 2),
                snap(150, "b", dec!(0.20), 2.5, 1, 3),
            ])
            .await
            .unwrap();
        let summary = arena.finalize_season(&season, 150).await.unwrap();

        // a: 0.4*0.05 + 0.3*62.5 + 0.3*10 = 21.77; b: 0.4*0.10 + 0.3*25 - 0.3*10 = 4.54
        assert_eq!(summary.champion.as_deref(), Some("a"));
        assert_eq!(summary.leaderboard.len(), 2);
        assert!((summary.leaderboard[0].score - 21.77).abs() < 1e-9);
        assert!((summary.leaderboard[1].score - 4.54).abs() < 1e-9);
        assert_eq!(summary.leaderboard.iter().filter(|e| e.champion).count(), 1);

        let stored = store.get_season(&season.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SeasonStatus::Completed);
        assert_eq!(stored.end_round, Some(150));
        assert!(store.load_state().await.unwrap().active_season.is_none());
        assert_eq!(store.leaderboard(&season.id).await.unwrap()[0].rank, 1);
    }

    #[tokio::test]
    async fn test_leaderboard_ties_break_by_agent_id() {
        let (store, arena) = arena(AppConfig::default());
        let season = arena.ensure_active_season(1).await.unwrap();
        store
            .save_snapshots(&[
                snap(1, "zed", dec!(0.1), 3.0, 1, 1),
                snap(1, "amy", dec!(0.1), 3.0, 1, 1),
            ])
            .await
            .unwrap();
        let summary = arena.finalize_season(&season, 1).await.unwrap();
        assert_eq!(summary.champion.as_deref(), Some("amy"));
    }

    #[tokio::test]
    async fn test_reset_pauses_agents_and_restarts_rounds() {
        let (store, arena) = arena(AppConfig::default());
        arena
            .seed_roster(&[seed("a1", AgentType::Catalog, Personality::Balanced)])
            .await
            .unwrap();
        arena.run_rounds("t", &RunRequest::default()).await.unwrap();
        let mut dead = Agent::new("gone", "Gone", AgentType::Seller, Personality::Balanced);
        dead.status = AgentStatus::Dead;
        store.insert_agent(&dead).await.unwrap();

        assert!(matches!(arena.reset("t").await.unwrap(), LockOutcome::Acquired { .. }));
        let state = store.load_state().await.unwrap();
        assert_eq!(state.current_round, 0);
        assert_eq!(state.last_completed_round, 0);
        assert!(state.active_season.is_none());
        assert!(state.lock_holder.is_none());
        assert_eq!(store.get_agent("a1").await.unwrap().unwrap().status, AgentStatus::Paused);
        assert_eq!(store.get_agent("gone").await.unwrap().unwrap().status, AgentStatus::Dead);
        assert!(store.ledger_for_round(1).await.unwrap().is_empty());

        assert_eq!(arena.resume_agents("t").await.unwrap(), ResumeOutcome::Resumed { resumed: 1 });

        arena.acquire_lock("scheduler").await.unwrap();
        assert!(matches!(
            arena.resume_agents("t").await.unwrap(),
            ResumeOutcome::Busy { ref holder, .. } if holder == "scheduler"
        ));
        arena.release_lock("scheduler").await.unwrap();
        let RunOutcome::Completed { rounds } =
            arena.run_rounds("t", &RunRequest::default()).await.unwrap()
        else {
            panic!("expected completed run");
        };
        assert_eq!(rounds[0].result.round, 1);
        assert_eq!(rounds[0].season, 2);
    }
}
