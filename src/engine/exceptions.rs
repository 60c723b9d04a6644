//! Exception detection and the periodic review (QBR) schedule.
//!
//! After each round every living agent is checked against the thresholds
//! in its own policy. A breach opens an [`ExceptionRecord`] (unless one of
//! the same type is still open) and asks the round for a decision wakeup.

use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::config::ExceptionsConfig;
use crate::policy::{ExceptionPolicy, Policy};
use crate::storage::SharedStore;
use crate::types::{Agent, ExceptionRecord, ExceptionType, RoundSnapshot};

/// A threshold breach before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Breach {
    pub exception_type: ExceptionType,
    pub metric_value: f64,
    pub threshold: f64,
}

/// Result of checking one agent after a round.
#[derive(Debug, Clone, Default)]
pub struct AgentCheck {
    pub agent_id: String,
    /// Exceptions opened this round.
    pub raised: Vec<ExceptionRecord>,
    pub qbr_due: bool,
    /// No threshold in breach and no balance decline this round.
    pub stable: bool,
}

impl AgentCheck {
    pub fn needs_wakeup(&self) -> bool {
        !self.raised.is_empty() || self.qbr_due
    }
}

fn win_rate(snapshots: &[&RoundSnapshot]) -> Option<f64> {
    let won: u32 = snapshots.iter().map(|s| s.won).sum();
    let lost: u32 = snapshots.iter().map(|s| s.lost).sum();
    let resolved = won + lost;
    (resolved > 0).then(|| won as f64 / resolved as f64)
}

pub struct ExceptionDetector {
    store: SharedStore,
    cfg: ExceptionsConfig,
}

impl ExceptionDetector {
    pub fn new(store: SharedStore, cfg: ExceptionsConfig) -> Self {
        Self { store, cfg }
    }

    /// Evaluate thresholds. `history` holds earlier snapshots of this agent
    /// (any order); `current` is the round just played.
    pub fn evaluate(
        agent: &Agent,
        thresholds: &ExceptionPolicy,
        history: &[RoundSnapshot],
        current: &RoundSnapshot,
    ) -> Vec<Breach> {
        let mut breaches = Vec::new();
        let window = thresholds.window_rounds.max(1);
        let round = current.round;

        if agent.consecutive_losses >= thresholds.consecutive_losses {
            breaches.push(Breach {
                exception_type: ExceptionType::ConsecutiveLosses,
                metric_value: agent.consecutive_losses as f64,
                threshold: thresholds.consecutive_losses as f64,
            });
        }

        if agent.peak_balance > Decimal::ZERO {
            let fraction = Decimal::from_f64_retain(thresholds.balance_floor_fraction)
                .unwrap_or(Decimal::ZERO);
            let floor = agent.peak_balance * fraction;
            if agent.balance < floor {
                breaches.push(Breach {
                    exception_type: ExceptionType::BalanceDrop,
                    metric_value: agent.balance.to_f64().unwrap_or(0.0),
                    threshold: floor.to_f64().unwrap_or(0.0),
                });
            }
        }

        let current_window: Vec<&RoundSnapshot> = history
            .iter()
            .filter(|s| s.round + window > round && s.round < round)
            .chain(std::iter::once(current))
            .collect();

        let peak_rep = current_window.iter().map(|s| s.reputation).fold(agent.reputation, f64::max);
        let drop = peak_rep - agent.reputation;
        if drop >= thresholds.reputation_drop {
            breaches.push(Breach {
                exception_type: ExceptionType::ReputationDrop,
                metric_value: drop,
                threshold: thresholds.reputation_drop,
            });
        }

        let previous_window: Vec<&RoundSnapshot> = history
            .iter()
            .filter(|s| s.round + 2 * window > round && s.round + window <= round)
            .collect();
        if let (Some(prev), Some(cur)) = (win_rate(&previous_window), win_rate(&current_window)) {
            if prev > 0.0 {
                let drop_pct = (prev - cur) / prev * 100.0;
                if drop_pct >= thresholds.win_rate_drop_pct {
                    breaches.push(Breach {
                        exception_type: ExceptionType::WinRateDrop,
                        metric_value: drop_pct,
                        threshold: thresholds.win_rate_drop_pct,
                    });
                }
            }
        }

        breaches
    }

    /// Check one agent after `current.round`, persisting new exceptions and
    /// updating its stability streak.
    pub async fn check_agent(
        &self,
        agent: &Agent,
        policy: Option<&Policy>,
        current: &RoundSnapshot,
    ) -> Result<AgentCheck> {
        let round = current.round;
        let thresholds = policy.map(Policy::exception_thresholds).unwrap_or_default();
        let window = thresholds.window_rounds.max(1);
        let from = round.saturating_sub(2 * window);
        let history: Vec<RoundSnapshot> = self
            .store
            .snapshots_for_agent(&agent.id, from, round.saturating_sub(1))
            .await?;

        let breaches = Self::evaluate(agent, &thresholds, &history, current);
        let in_breach = !breaches.is_empty();
        let open = self.store.open_exceptions(Some(&agent.id)).await?;

        let mut check = AgentCheck {
            agent_id: agent.id.clone(),
            ..AgentCheck::default()
        };
        for breach in breaches {
            if open.iter().any(|e| e.exception_type == breach.exception_type) {
                debug!(
                    agent_id = %agent.id,
                    kind = %breach.exception_type,
                    "Exception already open"
                );
                continue;
            }
            let record = ExceptionRecord::new(
                &agent.id,
                breach.exception_type,
                breach.metric_value,
                breach.threshold,
                round,
            );
            self.store.insert_exception(&record).await?;
            info!(
                round,
                agent_id = %agent.id,
                kind = %record.exception_type,
                value = format!("{:.4}", record.metric_value),
                threshold = format!("{:.4}", record.threshold),
                "Exception raised"
            );
            check.raised.push(record);
        }

        let previous_balance = history
            .iter()
            .filter(|s| s.round < round)
            .max_by_key(|s| s.round)
            .map(|s| s.balance);
        let balance_fell = matches!(previous_balance, Some(b) if agent.balance < b);
        check.stable = !in_breach && !balance_fell;
        check.qbr_due = Self::qbr_due(agent, round);
        Ok(check)
    }

    /// Whether the agent's periodic review is due at `round`.
    pub fn qbr_due(agent: &Agent, round: u64) -> bool {
        agent.next_qbr_round > 0 && round >= agent.next_qbr_round
    }

    /// Round of the next review after one held at `round`.
    pub fn next_review_round(agent: &Agent, policy: Option<&Policy>, round: u64) -> u64 {
        let schedule = policy.map(Policy::qbr_schedule).unwrap_or_default();
        round + schedule.next_interval(agent.consecutive_losses, agent.stable_rounds)
    }

    /// Close exceptions that have stayed open for `auto_resolve_rounds`.
    pub async fn auto_resolve(&self, round: u64) -> Result<Vec<ExceptionRecord>> {
        let mut closed = Vec::new();
        for mut record in self.store.open_exceptions(None).await? {
            if round.saturating_sub(record.detected_round) < self.cfg.auto_resolve_rounds {
                continue;
            }
            record.resolve(round);
            self.store.save_exception(&record).await?;
            debug!(
                agent_id = %record.agent_id,
                kind = %record.exception_type,
                "Exception auto-resolved"
            );
            closed.push(record);
        }
        if !closed.is_empty() {
            info!(round, count = closed.len(), "Auto-resolved stale exceptions");
        }
        Ok(closed)
    }

    /// Close every open exception of an agent (after a policy update).
    pub async fn resolve_for_agent(&self, agent_id: &str, round: u64) -> Result<usize> {
        let open = self.store.open_exceptions(Some(agent_id)).await?;
        for mut record in open.iter().cloned() {
            record.resolve(round);
            self.store.save_exception(&record).await?;
        }
        Ok(open.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
