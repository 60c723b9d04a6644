//! Reverse auction — validate and persist bids, pick one winner per task.
//!
//! Score = (base + min(reputation, cap) × multiplier) / amount. Price
//! dominates; reputation breaks near-ties. Equal scores go to the earliest
//! submission. Resolution commits only if the task is still OPEN, so two
//! concurrent resolutions can never both assign a winner.

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AuctionConfig;
use crate::engine::economy::EconomyService;
use crate::storage::SharedStore;
use crate::types::{ArenaError, Bid, BidStatus, TaskStatus};

/// Ranking function. Strictly decreasing in `amount`, non-decreasing in
/// `reputation` up to the cap.
pub fn score(cfg: &AuctionConfig, reputation: f64, amount: Decimal) -> f64 {
    let amount = amount.to_f64().unwrap_or(f64::MAX);
    if amount <= 0.0 {
        return 0.0;
    }
    let bonus = reputation.max(0.0).min(cfg.reputation_cap) * cfg.reputation_multiplier;
    (cfg.base_score + bonus) / amount
}

/// Outcome of a single task's auction.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub task_id: String,
    pub winner: String,
    pub winning_bid: String,
    pub amount: Decimal,
    pub score: f64,
    /// (agent_id, bid_id) of every rejected bid.
    pub rejected: Vec<(String, String)>,
}

/// Outcome of resolving every auction of a round.
#[derive(Debug, Clone, Default)]
pub struct RoundAuction {
    pub resolutions: Vec<Resolution>,
    /// (task_id, error) for tasks whose resolution failed.
    pub errors: Vec<(String, String)>,
}

pub struct AuctionService {
    store: SharedStore,
    economy: Arc<EconomyService>,
    cfg: AuctionConfig,
}

impl AuctionService {
    pub fn new(store: SharedStore, economy: Arc<EconomyService>, cfg: AuctionConfig) -> Self {
        Self { store, economy, cfg }
    }

    /// Validate and persist a batch of bids as PENDING. Any invalid bid
    /// rejects the whole batch and nothing is written.
    pub async fn submit_batch_bids(&self, bids: &[Bid]) -> Result<Vec<Bid>> {
        if bids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pairs = HashSet::new();
        let mut tasks = HashMap::new();
        for bid in bids {
            if bid.amount <= Decimal::ZERO {
                return Err(ArenaError::Validation(format!(
                    "bid {} has non-positive amount {}",
                    bid.id, bid.amount
                ))
                .into());
            }
            if !pairs.insert((bid.agent_id.as_str(), bid.task_id.as_str())) {
                return Err(ArenaError::Validation(format!(
                    "duplicate bid by {} on task {}",
                    bid.agent_id, bid.task_id
                ))
                .into());
            }
            if !tasks.contains_key(&bid.task_id) {
                let task = self
                    .store
                    .get_task(&bid.task_id)
                    .await?
                    .ok_or_else(|| ArenaError::TaskNotFound(bid.task_id.clone()))?;
                tasks.insert(bid.task_id.clone(), task);
            }
            let task = &tasks[&bid.task_id];
            if task.status != TaskStatus::Open {
                return Err(ArenaError::TaskNotOpen {
                    task_id: task.id.clone(),
                    status: task.status,
                }
                .into());
            }
            if bid.amount > task.max_bid {
                return Err(ArenaError::BidExceedsMax {
                    task_id: task.id.clone(),
                    amount: bid.amount,
                    max_bid: task.max_bid,
                }
                .into());
            }
        }

        let pending: Vec<Bid> = bids
            .iter()
            .cloned()
            .map(|mut b| {
                b.status = BidStatus::Pending;
                b
            })
            .collect();
        let stored = self.store.insert_bids(&pending).await?;
        debug!(count = stored.len(), "Bids submitted");
        Ok(stored)
    }

    /// Resolve one task. `Ok(None)` when the task is not OPEN, has no pending
    /// bids, or another resolution committed first.
    pub async fn resolve_task(&self, task_id: &str, round: u64) -> Result<Option<Resolution>> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(ArenaError::TaskNotFound(task_id.to_string()).into());
        };
        if !task.is_open() {
            debug!(task_id, status = %task.status, "Task already resolved, skipping");
            return Ok(None);
        }

        let mut bids: Vec<Bid> = self
            .store
            .bids_for_task(task_id)
            .await?
            .into_iter()
            .filter(|b| b.status == BidStatus::Pending)
            .collect();
        if bids.is_empty() {
            return Ok(None);
        }

        let mut scored = Vec::with_capacity(bids.len());
        for (idx, bid) in bids.iter().enumerate() {
            let reputation = match self.store.get_agent(&bid.agent_id).await? {
                Some(agent) => agent.reputation,
                None => 0.0,
            };
            scored.push((idx, score(&self.cfg, reputation, bid.amount), bid.sequence));
        }
        let (winner_idx, winner_score, _) = scored
            .iter()
            .copied()
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| b.2.cmp(&a.2))
            })
            .ok_or_else(|| anyhow::anyhow!("no scored bids for task {task_id}"))?;

        for (idx, bid) in bids.iter_mut().enumerate() {
            bid.status = if idx == winner_idx { BidStatus::Accepted } else { BidStatus::Rejected };
        }
        let winning = bids[winner_idx].clone();

        task.transition(TaskStatus::Assigned)?;
        task.assigned_agent = Some(winning.agent_id.clone());
        task.winning_bid = Some(winning.id.clone());
        task.winning_amount = Some(winning.amount);

        if !self.store.commit_resolution(&task, &bids).await? {
            info!(task_id, "Task resolved concurrently, discarding this resolution");
            return Ok(None);
        }

        info!(
            round,
            task_id,
            winner = %winning.agent_id,
            amount = %winning.amount,
            score = format!("{winner_score:.1}"),
            bidders = bids.len(),
            "Auction resolved"
        );

        self.settle(round, &bids).await;

        Ok(Some(Resolution {
            task_id: task_id.to_string(),
            winner: winning.agent_id.clone(),
            winning_bid: winning.id.clone(),
            amount: winning.amount,
            score: winner_score,
            rejected: bids
                .iter()
                .filter(|b| b.status == BidStatus::Rejected)
                .map(|b| (b.agent_id.clone(), b.id.clone()))
                .collect(),
        }))
    }

    /// Apply the economic side of resolved bids. Idempotent through the ledger.
    async fn settle(&self, round: u64, bids: &[Bid]) {
        for bid in bids {
            let result = match bid.status {
                BidStatus::Accepted => {
                    self.economy
                        .record_auction_win(round, &bid.agent_id, &bid.id)
                        .await
                }
                BidStatus::Rejected => {
                    self.economy
                        .charge_rejected_bid(round, &bid.agent_id, &bid.id)
                        .await
                }
                BidStatus::Pending => continue,
            };
            if let Err(e) = result {
                warn!(
                    round,
                    agent_id = %bid.agent_id,
                    bid_id = %bid.id,
                    error = %e,
                    "Failed to settle bid"
                );
            }
        }
    }

    /// Resolve every task that received bids in `round`, then settle all of
    /// the round's resolved bids (covering resolutions committed by an
    /// interrupted earlier run).
    pub async fn resolve_round(&self, round: u64) -> Result<RoundAuction> {
        let round_bids = self.store.bids_for_round(round).await?;
        let mut task_ids: Vec<String> = Vec::new();
        for bid in &round_bids {
            if !task_ids.contains(&bid.task_id) {
                task_ids.push(bid.task_id.clone());
            }
        }

        let mut result = RoundAuction::default();
        for task_id in &task_ids {
            match self.resolve_task(task_id, round).await {
                Ok(Some(resolution)) => result.resolutions.push(resolution),
                Ok(None) => {}
                Err(e) => {
                    warn!(round, task_id = %task_id, error = %e, "Auction resolution failed");
                    result.errors.push((task_id.clone(), e.to_string()));
                }
            }
        }

        let resolved = self.store.bids_for_round(round).await?;
        self.settle(round, &resolved).await;

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
