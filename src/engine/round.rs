//! RoundProcessor — one round as a single logical unit.
//!
//! expire → tasks → bidding → auction → execution → living costs →
//! statuses → exceptions → decisions → market memory.
//!
//! Every economic step goes through the ledger, so running a round that
//! was interrupted half-way completes it without applying anything twice.
//! Per-agent and per-task failures are collected in the result and never
//! abort the round.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::auction::AuctionService;
use super::bidding::{BidderContext, BiddingService, SkipDecision};
use super::economy::EconomyService;
use super::exceptions::ExceptionDetector;
use super::tasks::{TaskBatch, TaskService};
use crate::brain::{DecisionOutcome, PolicyDecisionEngine, Trigger, Wakeup};
use crate::config::ArenaConfig;
use crate::memory::MemoryService;
use crate::storage::SharedStore;
use crate::types::{AgentStatus, BidStatus, LedgerEntry, LedgerKind, RoundSnapshot, TaskStatus};

/// Caller-supplied knobs for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundParams {
    pub tasks_per_round: usize,
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// Restrict bidding to these agents.
    #[serde(default)]
    pub agent_ids: Option<Vec<String>>,
}

impl RoundParams {
    pub fn from_config(cfg: &ArenaConfig) -> Self {
        Self {
            tasks_per_round: cfg.tasks_per_round,
            min_price: cfg.min_price,
            max_price: cfg.max_price,
            agent_ids: None,
        }
    }
}

/// Agent state at the end of a round.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRoundState {
    pub agent_id: String,
    pub status: AgentStatus,
    pub balance: Decimal,
    pub reputation: f64,
    pub policy_version: u32,
    pub won: u32,
    pub lost: u32,
}

/// A failure isolated to one agent or task.
#[derive(Debug, Clone, Serialize)]
pub struct RoundError {
    /// Agent id, task id or phase name.
    pub scope: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoundResult {
    pub round: u64,
    /// The round had already completed; nothing was applied.
    pub replayed: bool,
    pub tasks_processed: usize,
    pub tasks_expired: usize,
    pub bids_placed: usize,
    pub bids_skipped: usize,
    pub skips: Vec<SkipDecision>,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub revenue_total: Decimal,
    pub exceptions_raised: usize,
    pub agents: Vec<AgentRoundState>,
    pub wakeups: Vec<DecisionOutcome>,
    pub errors: Vec<RoundError>,
}

impl RoundResult {
    fn error(&mut self, scope: impl Into<String>, err: &anyhow::Error) {
        let scope = scope.into();
        warn!(round = self.round, scope = %scope, error = %err, "Round step failed");
        self.errors.push(RoundError {
            scope,
            message: format!("{err:#}"),
        });
    }
}

/// Per-agent snapshots for `round`, with win/loss counts from the round's bids.
pub async fn round_snapshots(store: &SharedStore, round: u64) -> Result<Vec<RoundSnapshot>> {
    let mut tally: HashMap<String, (u32, u32)> = HashMap::new();
    for bid in store.bids_for_round(round).await? {
        let entry = tally.entry(bid.agent_id.clone()).or_default();
        match bid.status {
            BidStatus::Accepted => entry.0 += 1,
            BidStatus::Rejected => entry.1 += 1,
            BidStatus::Pending => {}
        }
    }
    Ok(store
        .list_agents()
        .await?
        .into_iter()
        .map(|a| {
            let (won, lost) = tally.get(&a.id).copied().unwrap_or_default();
            RoundSnapshot {
                round,
                agent_id: a.id,
                balance: a.balance,
                reputation: a.reputation,
                status: a.status,
                won,
                lost,
            }
        })
        .collect())
}

pub struct RoundProcessor {
    store: SharedStore,
    tasks: TaskService,
    economy: Arc<EconomyService>,
    auction: AuctionService,
    detector: Arc<ExceptionDetector>,
    brain: Arc<PolicyDecisionEngine>,
    memory: Arc<MemoryService>,
    deadline_rounds: u64,
}

impl RoundProcessor {
    pub fn new(
        store: SharedStore,
        economy: Arc<EconomyService>,
        auction: AuctionService,
        detector: Arc<ExceptionDetector>,
        brain: Arc<PolicyDecisionEngine>,
        memory: Arc<MemoryService>,
        deadline_rounds: u64,
    ) -> Self {
        Self {
            tasks: TaskService::new(store.clone()),
            store,
            economy,
            auction,
            detector,
            brain,
            memory,
            deadline_rounds,
        }
    }

    pub async fn process(&self, round: u64, params: &RoundParams) -> Result<RoundResult> {
        let mut result = RoundResult {
            round,
            ..RoundResult::default()
        };

        let state = self.store.load_state().await?;
        if round <= state.last_completed_round {
            info!(
                round,
                last_completed = state.last_completed_round,
                "Round already completed, replay is a no-op"
            );
            result.replayed = true;
            result.agents = self.agent_states(round).await?;
            return Ok(result);
        }

        info!(round, tasks = params.tasks_per_round, "Round starting");

        match self.tasks.expire_overdue(round).await {
            Ok(expired) => result.tasks_expired = expired.len(),
            Err(e) => result.error("expire", &e),
        }

        let batch = TaskBatch {
            count: params.tasks_per_round,
            min_price: params.min_price,
            max_price: params.max_price,
            deadline_rounds: self.deadline_rounds,
            types: Vec::new(),
        };
        let created = self
            .tasks
            .generate_round_tasks(round, &batch)
            .await
            .with_context(|| format!("Failed to create tasks for round {round}"))?;
        result.tasks_processed = created.len();

        self.run_bidding(round, params, &mut result).await?;

        let auction = self.auction.resolve_round(round).await?;
        for (task_id, message) in auction.errors {
            result.errors.push(RoundError { scope: task_id, message });
        }

        self.run_execution(round, &mut result).await?;
        self.charge_living_costs(round, &mut result).await?;
        self.recompute_statuses(&mut result).await?;

        let wakeups = self.detect_exceptions(round, &mut result).await?;
        if let Err(e) = self.detector.auto_resolve(round).await {
            result.error("auto-resolve", &e);
        }
        if !wakeups.is_empty() {
            result.wakeups = self.brain.wake_many(wakeups, round).await;
        }

        if let Err(e) = self.record_market_summary(round, &result).await {
            result.error("market-memory", &e);
        }
        result.agents = self.agent_states(round).await?;

        info!(
            round,
            bids = result.bids_placed,
            skipped = result.bids_skipped,
            completed = result.tasks_completed,
            failed = result.tasks_failed,
            revenue = %result.revenue_total,
            wakeups = result.wakeups.len(),
            errors = result.errors.len(),
            "Round complete"
        );
        Ok(result)
    }

    async fn run_bidding(
        &self,
        round: u64,
        params: &RoundParams,
        result: &mut RoundResult,
    ) -> Result<()> {
        let filter: Option<HashSet<&str>> = params
            .agent_ids
            .as_ref()
            .map(|ids| ids.iter().map(String::as_str).collect());

        let mut bidders = Vec::new();
        for agent in self.store.list_agents().await? {
            let selected = filter
                .as_ref()
                .map_or(true, |f| f.contains(agent.id.as_str()));
            if !agent.is_operating() || !selected {
                continue;
            }
            match self.store.latest_policy(&agent.id).await {
                Ok(policy) => bidders.push(BidderContext {
                    agent,
                    policy: policy.map(|v| v.policy),
                }),
                Err(e) => result.error(agent.id.clone(), &e),
            }
        }

        let open = self.tasks.open_tasks().await?;
        let plan = BiddingService::generate(&bidders, &open, round);

        // Pairs already bid on by an interrupted run of this round.
        let existing: HashSet<(String, String)> = self
            .store
            .bids_for_round(round)
            .await?
            .into_iter()
            .map(|b| (b.agent_id, b.task_id))
            .collect();
        let fresh: Vec<_> = plan
            .bids
            .into_iter()
            .filter(|b| !existing.contains(&(b.agent_id.clone(), b.task_id.clone())))
            .collect();

        result.bids_skipped = plan.skips.len();
        result.skips = plan.skips;
        match self.auction.submit_batch_bids(&fresh).await {
            Ok(stored) => result.bids_placed = stored.len(),
            Err(e) => result.error("bidding", &e),
        }
        debug!(round, bidders = bidders.len(), open_tasks = open.len(), "Bidding done");
        Ok(())
    }

    /// Run every task won this round: complete it, or fail it when the
    /// estimated cost exceeds the winner's cost ceiling.
    async fn run_execution(&self, round: u64, result: &mut RoundResult) -> Result<()> {
        let accepted: Vec<_> = self
            .store
            .bids_for_round(round)
            .await?
            .into_iter()
            .filter(|b| b.status == BidStatus::Accepted)
            .collect();

        for bid in accepted {
            let step = async {
                let Some(task) = self.store.get_task(&bid.task_id).await? else {
                    return Ok::<_, anyhow::Error>(None);
                };
                let cost = bid.snapshot.cost_basis;
                let ceiling = self
                    .store
                    .latest_policy(&bid.agent_id)
                    .await?
                    .and_then(|v| v.policy.execution)
                    .and_then(|e| e.cost_ceiling);
                let over_ceiling = matches!(ceiling, Some(c) if cost > c);

                let task = match task.status {
                    TaskStatus::Assigned if over_ceiling => self.tasks.fail(&task.id, round).await?,
                    TaskStatus::Assigned => {
                        self.tasks.start(&task.id).await?;
                        self.tasks.complete(&task.id, round).await?
                    }
                    TaskStatus::InProgress => self.tasks.complete(&task.id, round).await?,
                    _ => task,
                };
                match task.status {
                    TaskStatus::Completed => {
                        let outcome = self.economy.settle_completion(round, &task, cost).await?;
                        Ok(Some((true, outcome.revenue)))
                    }
                    TaskStatus::Failed => {
                        self.economy.settle_failure(round, &task).await?;
                        Ok(Some((false, Decimal::ZERO)))
                    }
                    _ => Ok(None),
                }
            };
            match step.await {
                Ok(Some((true, revenue))) => {
                    result.tasks_completed += 1;
                    result.revenue_total += revenue;
                }
                Ok(Some((false, _))) => result.tasks_failed += 1,
                Ok(None) => {}
                Err(e) => result.error(bid.task_id.clone(), &e),
            }
        }
        Ok(())
    }

    async fn charge_living_costs(&self, round: u64, result: &mut RoundResult) -> Result<()> {
        for agent in self.store.list_agents().await? {
            if !agent.is_operating() {
                continue;
            }
            if let Err(e) = self.economy.charge_living_cost(round, &agent.id).await {
                result.error(agent.id.clone(), &e);
            }
        }
        Ok(())
    }

    async fn recompute_statuses(&self, result: &mut RoundResult) -> Result<()> {
        for agent in self.store.list_agents().await? {
            if agent.is_dead() {
                continue;
            }
            if let Err(e) = self.economy.recompute_status(&agent.id).await {
                result.error(agent.id.clone(), &e);
            }
        }
        Ok(())
    }

    /// Check thresholds and the review schedule; returns the wakeups to run.
    /// An exception takes priority over a due review.
    async fn detect_exceptions(&self, round: u64, result: &mut RoundResult) -> Result<Vec<Wakeup>> {
        let snapshots: HashMap<String, RoundSnapshot> = round_snapshots(&self.store, round)
            .await?
            .into_iter()
            .map(|s| (s.agent_id.clone(), s))
            .collect();

        let mut wakeups = Vec::new();
        for agent in self.store.list_agents().await? {
            if agent.is_dead() || agent.status == AgentStatus::Unfunded {
                continue;
            }
            let Some(current) = snapshots.get(&agent.id) else {
                continue;
            };
            let checked = async {
                let policy = self.store.latest_policy(&agent.id).await?.map(|v| v.policy);
                let check = self.detector.check_agent(&agent, policy.as_ref(), current).await?;
                let stable = check.stable;
                let mark = LedgerEntry::new(
                    round,
                    &agent.id,
                    LedgerKind::Stability,
                    "stability",
                    Decimal::ZERO,
                );
                self.economy
                    .apply(mark, |a| {
                        a.stable_rounds = if stable { a.stable_rounds + 1 } else { 0 };
                    })
                    .await?;
                Ok::<_, anyhow::Error>((check, policy))
            };
            let (mut check, policy) = match checked.await {
                Ok(v) => v,
                Err(e) => {
                    result.error(agent.id.clone(), &e);
                    continue;
                }
            };
            result.exceptions_raised += check.raised.len();
            if !check.needs_wakeup() {
                continue;
            }

            if !check.raised.is_empty() {
                let record = check.raised.remove(0);
                wakeups.push(Wakeup::new(&agent.id, Trigger::Exception { record }));
            } else {
                let period_start = match self.store.qbr_history(&agent.id, 1).await {
                    Ok(history) => history.first().map(|r| r.period_end + 1),
                    Err(e) => {
                        result.error(agent.id.clone(), &e);
                        None
                    }
                }
                .unwrap_or_else(|| {
                    let base = policy
                        .as_ref()
                        .map(|p| p.qbr_schedule())
                        .unwrap_or_default()
                        .base_frequency_rounds;
                    (round + 1).saturating_sub(base).max(1)
                });
                wakeups.push(Wakeup::new(
                    &agent.id,
                    Trigger::Qbr {
                        period_start,
                        period_end: round,
                    },
                ));
            }
        }
        Ok(wakeups)
    }

    async fn record_market_summary(&self, round: u64, result: &RoundResult) -> Result<()> {
        if matches!(self.memory.market_feed(1).await?.first(), Some(m) if m.round == round) {
            return Ok(());
        }
        let avg = if result.tasks_completed > 0 {
            (result.revenue_total / Decimal::from(result.tasks_completed as u64)).round_dp(6)
        } else {
            Decimal::ZERO
        };
        let summary = format!(
            "Round {round}: {} tasks, {} bids, {} completed, {} failed, \
             average price ${avg}, {} exception(s)",
            result.tasks_processed,
            result.bids_placed,
            result.tasks_completed,
            result.tasks_failed,
            result.exceptions_raised,
        );
        self.memory.record_market(summary, round).await?;
        Ok(())
    }

    async fn agent_states(&self, round: u64) -> Result<Vec<AgentRoundState>> {
        let policy_versions: HashMap<String, u32> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .map(|a| (a.id, a.policy_version))
            .collect();
        Ok(round_snapshots(&self.store, round)
            .await?
            .into_iter()
            .map(|s| AgentRoundState {
                policy_version: policy_versions.get(&s.agent_id).copied().unwrap_or_default(),
                agent_id: s.agent_id,
                status: s.status,
                balance: s.balance,
                reputation: s.reputation,
                won: s.won,
                lost: s.lost,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
