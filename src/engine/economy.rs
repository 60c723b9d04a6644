//! Economy — balances, reputation, counters and status transitions.
//!
//! Every effect is recorded as a [`LedgerEntry`] keyed by
//! `(round, agent, kind, reference)` and committed together with the
//! updated agent. An entry that is already in the ledger is skipped, so a
//! replayed round never applies anything twice. Debits floor at zero and
//! the shortfall is absorbed silently.

use anyhow::Result;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EconomyConfig;
use crate::storage::SharedStore;
use crate::types::{
    Agent, AgentStatus, ArenaError, LedgerEntry, LedgerKind, PartnershipStatus, Task,
};

/// What a completed task paid out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOutcome {
    pub revenue: Decimal,
    pub operational_cost: Decimal,
    /// Share moved to the winner's partner, if any.
    pub partner_share: Decimal,
    pub partner: Option<String>,
}

pub struct EconomyService {
    store: SharedStore,
    cfg: EconomyConfig,
    /// Serialises read-modify-write cycles on agents.
    writes: Mutex<()>,
}

impl EconomyService {
    pub fn new(store: SharedStore, cfg: EconomyConfig) -> Self {
        Self {
            store,
            cfg,
            writes: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EconomyConfig {
        &self.cfg
    }

    /// Apply one ledgered effect: the entry amount as a floor-clamped balance
    /// delta, then `mutate`. Returns the updated agent, or `None` when the
    /// entry had already been recorded.
    pub async fn apply<F>(&self, mut entry: LedgerEntry, mutate: F) -> Result<Option<Agent>>
    where
        F: FnOnce(&mut Agent) + Send,
    {
        let _guard = self.writes.lock().await;
        let mut agent = self
            .store
            .get_agent(&entry.agent_id)
            .await?
            .ok_or_else(|| ArenaError::AgentNotFound(entry.agent_id.clone()))?;

        let applied = agent.apply_balance_delta(entry.amount);
        if applied != entry.amount {
            debug!(
                agent_id = %agent.id,
                requested = %entry.amount,
                applied = %applied,
                "Debit clamped at zero balance"
            );
        }
        entry.amount = applied;
        mutate(&mut agent);
        self.refresh_band(&mut agent);

        if self.store.commit_ledger_entry(&entry, &agent).await? {
            Ok(Some(agent))
        } else {
            debug!(
                round = entry.round,
                agent_id = %entry.agent_id,
                kind = entry.kind.as_str(),
                reference = %entry.reference,
                "Ledger entry already recorded, skipping"
            );
            Ok(None)
        }
    }

    /// ACTIVE ↔ LOW_FUNDS around the low-balance threshold.
    fn refresh_band(&self, agent: &mut Agent) {
        if !agent.is_operating() {
            return;
        }
        agent.status = if agent.balance < self.cfg.low_balance_threshold {
            AgentStatus::LowFunds
        } else {
            AgentStatus::Active
        };
    }

    /// Status implied by the agent's balance and open obligations.
    pub fn next_status(&self, agent: &Agent, pending_tasks: usize) -> AgentStatus {
        match agent.status {
            AgentStatus::Dead | AgentStatus::Paused | AgentStatus::Unfunded => agent.status,
            AgentStatus::Active | AgentStatus::LowFunds => {
                if agent.balance.is_zero() && pending_tasks == 0 {
                    AgentStatus::Dead
                } else if agent.balance < self.cfg.low_balance_threshold {
                    AgentStatus::LowFunds
                } else {
                    AgentStatus::Active
                }
            }
        }
    }

    /// Recompute and persist one agent's status.
    pub async fn recompute_status(&self, agent_id: &str) -> Result<Agent> {
        let _guard = self.writes.lock().await;
        let mut agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| ArenaError::AgentNotFound(agent_id.to_string()))?;
        let pending = self.store.pending_task_count(agent_id).await?;
        let next = self.next_status(&agent, pending);
        if next != agent.status {
            if next == AgentStatus::Dead {
                warn!(agent_id, "Agent has died, balance depleted");
            } else {
                info!(agent_id, from = %agent.status, to = %next, "Agent status changed");
            }
            agent.status = next;
            self.store.save_agent(&agent).await?;
        }
        Ok(agent)
    }

    /// Non-monetary bookkeeping (review schedule, stability streak) under
    /// the same write lock as ledgered effects.
    pub async fn amend<F>(&self, agent_id: &str, mutate: F) -> Result<Agent>
    where
        F: FnOnce(&mut Agent) + Send,
    {
        let _guard = self.writes.lock().await;
        let mut agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| ArenaError::AgentNotFound(agent_id.to_string()))?;
        mutate(&mut agent);
        self.store.save_agent(&agent).await?;
        Ok(agent)
    }

    // -- Effects ------------------------------------------------------------

    /// Credit an agent. UNFUNDED and PAUSED agents become ACTIVE.
    pub async fn fund_agent(
        &self,
        round: u64,
        agent_id: &str,
        amount: Decimal,
        reference: &str,
    ) -> Result<Option<Agent>> {
        if amount <= Decimal::ZERO {
            return Err(
                ArenaError::Validation(format!("funding must be positive, got {amount}")).into(),
            );
        }
        if let Some(agent) = self.store.get_agent(agent_id).await? {
            if agent.is_dead() {
                return Err(ArenaError::Validation(format!("agent {agent_id} is dead")).into());
            }
        }
        let entry = LedgerEntry::new(round, agent_id, LedgerKind::Funding, reference, amount);
        let funded = self
            .apply(entry, |a| {
                if matches!(a.status, AgentStatus::Unfunded | AgentStatus::Paused) {
                    a.status = AgentStatus::Active;
                }
            })
            .await?;
        if let Some(a) = &funded {
            info!(agent_id, amount = %amount, balance = %a.balance, "Agent funded");
        }
        Ok(funded)
    }

    /// Debit the fixed living cost.
    pub async fn charge_living_cost(&self, round: u64, agent_id: &str) -> Result<Option<Agent>> {
        let entry = LedgerEntry::new(
            round,
            agent_id,
            LedgerKind::LivingCost,
            "living",
            -self.cfg.living_cost,
        );
        self.apply(entry, |_| {}).await
    }

    /// Win counters for an accepted bid.
    pub async fn record_auction_win(
        &self,
        round: u64,
        agent_id: &str,
        bid_id: &str,
    ) -> Result<Option<Agent>> {
        let entry =
            LedgerEntry::new(round, agent_id, LedgerKind::AuctionWin, bid_id, Decimal::ZERO);
        self.apply(entry, |a| a.record_win()).await
    }

    /// Bidding cost, loss counters and reputation penalty for a rejected bid.
    pub async fn charge_rejected_bid(
        &self,
        round: u64,
        agent_id: &str,
        bid_id: &str,
    ) -> Result<Option<Agent>> {
        let delta = self.cfg.reputation_loss_delta;
        let entry = LedgerEntry::new(
            round,
            agent_id,
            LedgerKind::BiddingCost,
            bid_id,
            -self.cfg.bidding_cost,
        );
        self.apply(entry, |a| {
            a.record_loss();
            a.apply_reputation_delta(-delta);
        })
        .await
    }

    /// Decision-engine cost for an applied policy change, moving the agent to
    /// `version`. Never gates the change.
    pub async fn charge_decision_cost(
        &self,
        round: u64,
        agent_id: &str,
        version: u32,
    ) -> Result<Option<Agent>> {
        let entry = LedgerEntry::new(
            round,
            agent_id,
            LedgerKind::DecisionCost,
            format!("policy-v{version}"),
            -self.cfg.decision_cost,
        );
        self.apply(entry, |a| a.policy_version = version).await
    }

    /// Revenue and operational cost of a completed task, then the partner split.
    pub async fn settle_completion(
        &self,
        round: u64,
        task: &Task,
        cost: Decimal,
    ) -> Result<CompletionOutcome> {
        let winner = task.assigned_agent.clone().ok_or_else(|| {
            ArenaError::Validation(format!("task {} has no assigned agent", task.id))
        })?;
        let revenue = task.winning_amount.unwrap_or(Decimal::ZERO);
        let win_delta = self.cfg.reputation_win_delta;
        let mut outcome = CompletionOutcome::default();

        let credit = LedgerEntry::new(round, &winner, LedgerKind::Revenue, &task.id, revenue);
        if self
            .apply(credit, |a| {
                a.tasks_completed += 1;
                a.apply_reputation_delta(win_delta);
                if a.status == AgentStatus::Unfunded {
                    a.status = AgentStatus::Active;
                }
            })
            .await?
            .is_some()
        {
            outcome.revenue = revenue;
        }

        let debit = LedgerEntry::new(round, &winner, LedgerKind::OperationalCost, &task.id, -cost);
        if self.apply(debit, |_| {}).await?.is_some() {
            outcome.operational_cost = cost;
        }

        let profit = revenue - cost;
        if profit > Decimal::ZERO {
            if let Some((partner, share)) = self
                .split_with_partner(round, &winner, &task.id, revenue, profit)
                .await?
            {
                outcome.partner = Some(partner);
                outcome.partner_share = share;
            }
        }

        debug!(
            round,
            task_id = %task.id,
            agent_id = %winner,
            revenue = %revenue,
            cost = %cost,
            "Task settled"
        );
        Ok(outcome)
    }

    /// Move the partner's share of `profit` from the winner to the partner.
    async fn split_with_partner(
        &self,
        round: u64,
        winner: &str,
        task_id: &str,
        revenue: Decimal,
        profit: Decimal,
    ) -> Result<Option<(String, Decimal)>> {
        let partnerships = self.store.partnerships_for_agent(winner).await?;
        let Some(mut partnership) = partnerships
            .into_iter()
            .find(|p| p.status == PartnershipStatus::Active)
        else {
            return Ok(None);
        };
        let (Some(partner), Some(own_share)) = (
            partnership.counterpart(winner).map(str::to_string),
            partnership.share_of(winner),
        ) else {
            return Ok(None);
        };

        let share = (profit * Decimal::from(100 - own_share) / Decimal::ONE_HUNDRED).round_dp(6);
        if share <= Decimal::ZERO {
            return Ok(None);
        }

        let debit = LedgerEntry::new(round, winner, LedgerKind::PartnerShare, task_id, -share);
        let Some(_) = self.apply(debit, |_| {}).await? else {
            return Ok(None);
        };
        let credit = LedgerEntry::new(round, &partner, LedgerKind::PartnerShare, task_id, share);
        self.apply(credit, |_| {}).await?;

        partnership.joint_revenue += revenue;
        self.store.save_partnership(&partnership).await?;
        info!(round, winner, partner = %partner, share = %share, "Partner share paid");
        Ok(Some((partner, share)))
    }

    /// Reputation penalty and failure counter for a failed task.
    pub async fn settle_failure(&self, round: u64, task: &Task) -> Result<Option<Agent>> {
        let agent_id = task.assigned_agent.clone().ok_or_else(|| {
            ArenaError::Validation(format!("task {} has no assigned agent", task.id))
        })?;
        let delta = self.cfg.reputation_fail_delta;
        let entry =
            LedgerEntry::new(round, agent_id, LedgerKind::TaskFailure, &task.id, Decimal::ZERO);
        self.apply(entry, |a| {
            a.tasks_failed += 1;
            a.apply_reputation_delta(-delta);
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
