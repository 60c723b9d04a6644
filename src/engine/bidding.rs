//! Bidding — turn an agent's policy and an open task into a bid or a skip.
//!
//! Pure computation over supplied state: no store access, no clock beyond
//! the bid timestamp. The cost table is keyed by category and skill tier.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::policy::{BiddingPolicy, Policy, SurvivalMode};
use crate::types::{Agent, AgentType, Bid, PolicySnapshot, PolicySource, SkillTier, Task};

// ---------------------------------------------------------------------------
// Cost table
// ---------------------------------------------------------------------------

/// Estimated cost of executing one task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostBreakdown {
    pub inference: Decimal,
    pub data: Decimal,
    pub storage: Decimal,
    pub submission: Decimal,
}

impl CostBreakdown {
    pub fn total(&self) -> Decimal {
        self.inference + self.data + self.storage + self.submission
    }
}

/// Per-category base costs at the standard skill tier.
fn base_cost(agent_type: AgentType) -> CostBreakdown {
    match agent_type {
        AgentType::Catalog => CostBreakdown {
            inference: dec!(0.003),
            data: dec!(0.0005),
            storage: dec!(0.0002),
            submission: dec!(0.0003),
        },
        AgentType::Review => CostBreakdown {
            inference: dec!(0.002),
            data: dec!(0.0008),
            storage: dec!(0.0001),
            submission: dec!(0.0003),
        },
        AgentType::Curation => CostBreakdown {
            inference: dec!(0.004),
            data: dec!(0.001),
            storage: dec!(0.0003),
            submission: dec!(0.0003),
        },
        AgentType::Seller => CostBreakdown {
            inference: dec!(0.005),
            data: dec!(0.0005),
            storage: dec!(0.0002),
            submission: dec!(0.0003),
        },
    }
}

/// Skill scales the inference component only.
fn skill_multiplier(skill: SkillTier) -> Decimal {
    match skill {
        SkillTier::Basic => dec!(0.75),
        SkillTier::Standard => Decimal::ONE,
        SkillTier::Expert => dec!(1.5),
    }
}

/// Look up the estimated execution cost for a category and skill tier.
pub fn estimate_cost(agent_type: AgentType, skill: SkillTier) -> CostBreakdown {
    let mut cost = base_cost(agent_type);
    cost.inference *= skill_multiplier(skill);
    cost
}

// ---------------------------------------------------------------------------
// Inputs & outputs
// ---------------------------------------------------------------------------

/// An eligible agent together with its stored policy, if any.
#[derive(Debug, Clone)]
pub struct BidderContext {
    pub agent: Agent,
    pub policy: Option<Policy>,
}

impl BidderContext {
    /// Bidding rules in force and where they came from.
    fn bidding(&self) -> (BiddingPolicy, PolicySource, Option<SurvivalMode>) {
        match self.policy.as_ref().and_then(|p| p.bidding.clone().map(|b| (b, p.survival_mode))) {
            Some((bidding, mode)) => (bidding, PolicySource::Policy, mode),
            None => (
                Policy::personality_bidding(self.agent.personality),
                PolicySource::PersonalityDefault,
                None,
            ),
        }
    }
}

/// Why an (agent, task) pair produced no bid.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    BelowReserveFloor { balance: Decimal, reserve_floor: Decimal },
    CostAtOrAboveMaxBid { cost: Decimal, max_bid: Decimal },
    MarginBelowMinimum { margin: Decimal, min_margin: Decimal },
    ProfitBelowThreshold { profit: Decimal, skip_below: Decimal },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::BelowReserveFloor { balance, reserve_floor } => {
                write!(f, "balance ${balance:.4} below reserve ${reserve_floor:.4}")
            }
            SkipReason::CostAtOrAboveMaxBid { cost, max_bid } => {
                write!(f, "cost ${cost:.4} >= max bid ${max_bid:.4}")
            }
            SkipReason::MarginBelowMinimum { margin, min_margin } => {
                write!(f, "margin {margin:.4} below minimum {min_margin:.4}")
            }
            SkipReason::ProfitBelowThreshold { profit, skip_below } => {
                write!(f, "profit ${profit:.5} below ${skip_below:.5}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SkipDecision {
    pub agent_id: String,
    pub task_id: String,
    pub reason: SkipReason,
}

/// Result of a bidding pass: bids plus a parallel list of skips.
#[derive(Debug, Clone, Default)]
pub struct BidPlan {
    pub bids: Vec<Bid>,
    pub skips: Vec<SkipDecision>,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct BiddingService;

impl BiddingService {
    /// Margin after the survival-mode adjustment.
    pub fn effective_margin(target: Decimal, mode: Option<SurvivalMode>) -> Decimal {
        match mode {
            Some(m) => target * m.margin_multiplier(),
            None => target,
        }
    }

    /// Decide one (agent, task) pair.
    pub fn evaluate(bidder: &BidderContext, task: &Task, round: u64) -> Result<Bid, SkipReason> {
        let agent = &bidder.agent;
        let (rules, source, mode) = bidder.bidding();

        if agent.balance < rules.reserve_floor {
            return Err(SkipReason::BelowReserveFloor {
                balance: agent.balance,
                reserve_floor: rules.reserve_floor,
            });
        }

        let cost = estimate_cost(agent.agent_type, agent.skill).total();
        if cost >= task.max_bid {
            return Err(SkipReason::CostAtOrAboveMaxBid { cost, max_bid: task.max_bid });
        }

        let margin = Self::effective_margin(rules.target_margin, mode);
        let amount = (cost * (Decimal::ONE + margin)).min(task.max_bid).round_dp(6);
        let margin_used = (amount - cost) / cost;
        if margin_used < rules.min_margin {
            return Err(SkipReason::MarginBelowMinimum {
                margin: margin_used.round_dp(6),
                min_margin: rules.min_margin,
            });
        }

        let profit = amount - cost;
        if profit < rules.skip_below {
            return Err(SkipReason::ProfitBelowThreshold { profit, skip_below: rules.skip_below });
        }

        let snapshot = PolicySnapshot {
            source,
            policy_version: agent.policy_version,
            margin: margin_used.round_dp(6),
            cost_basis: cost,
            survival_mode: mode,
        };
        Ok(Bid::new(&task.id, &agent.id, round, amount, snapshot))
    }

    /// Produce at most one bid per (agent, task) pair whose categories match.
    pub fn generate(bidders: &[BidderContext], tasks: &[Task], round: u64) -> BidPlan {
        let mut plan = BidPlan::default();
        let mut seen: HashSet<(&str, &str)> = HashSet::new();

        for bidder in bidders {
            if !bidder.agent.is_operating() {
                continue;
            }
            let matching = tasks
                .iter()
                .filter(|t| t.is_open() && t.task_type == bidder.agent.agent_type);
            for task in matching {
                if !seen.insert((bidder.agent.id.as_str(), task.id.as_str())) {
                    continue;
                }
                match Self::evaluate(bidder, task, round) {
                    Ok(bid) => plan.bids.push(bid),
                    Err(reason) => {
                        debug!(
                            agent_id = %bidder.agent.id,
                            task_id = %task.id,
                            %reason,
                            "Skipping task"
                        );
                        plan.skips.push(SkipDecision {
                            agent_id: bidder.agent.id.clone(),
                            task_id: task.id.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        plan
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
