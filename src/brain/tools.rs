//! Capability registry — the fixed set of queries and actions the decision
//! model may call.
//!
//! Calls arrive as `(name, input)` pairs and are parsed into the
//! [`Capability`] tagged union; there is no dynamic dispatch by name beyond
//! that parse. Queries are implemented here as pure reads; actions are
//! executed by the engine.

use anyhow::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::AuctionConfig;
use crate::engine::auction::score;
use crate::engine::bidding::{estimate_cost, BidderContext, BiddingService};
use crate::policy::{Policy, PolicyPatch};
use crate::storage::SharedStore;
use crate::types::{Agent, AgentType, ArenaError, PartnershipStatus, TaskStatus};

/// Every capability, with its input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "input", rename_all = "snake_case")]
pub enum Capability {
    // -- Queries ------------------------------------------------------------
    GetMarketSnapshot {},
    SearchAgents {
        #[serde(default)]
        agent_type: Option<AgentType>,
        #[serde(default)]
        min_reputation: Option<f64>,
        #[serde(default)]
        limit: Option<usize>,
    },
    GetMyStats {},
    GetQbrContext {},
    GetPartnerships {},
    AnalyzeCompatibility {
        agent_id: String,
    },
    PredictPolicyImpact {
        patch: PolicyPatch,
    },

    // -- Actions ------------------------------------------------------------
    UpdatePolicy {
        patch: PolicyPatch,
        reasoning: String,
    },
    ProposePartnership {
        target_agent_id: String,
        #[serde(default)]
        split: Option<u8>,
    },
    EndPartnership {
        partner_agent_id: String,
        reason: String,
    },
    RecordTransparency {
        message: String,
    },
}

impl Capability {
    /// Parse a model call. Unknown names and malformed inputs are errors.
    pub fn parse(name: &str, input: &Value) -> Result<Self, ArenaError> {
        let input = if input.is_null() { json!({}) } else { input.clone() };
        serde_json::from_value(json!({ "tool": name, "input": input }))
            .map_err(|e| ArenaError::Validation(format!("invalid call to {name}: {e}")))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Capability::GetMarketSnapshot {} => "get_market_snapshot",
            Capability::SearchAgents { .. } => "search_agents",
            Capability::GetMyStats {} => "get_my_stats",
            Capability::GetQbrContext {} => "get_qbr_context",
            Capability::GetPartnerships {} => "get_partnerships",
            Capability::AnalyzeCompatibility { .. } => "analyze_compatibility",
            Capability::PredictPolicyImpact { .. } => "predict_policy_impact",
            Capability::UpdatePolicy { .. } => "update_policy",
            Capability::ProposePartnership { .. } => "propose_partnership",
            Capability::EndPartnership { .. } => "end_partnership",
            Capability::RecordTransparency { .. } => "record_transparency",
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(
            self,
            Capability::UpdatePolicy { .. }
                | Capability::ProposePartnership { .. }
                | Capability::EndPartnership { .. }
                | Capability::RecordTransparency { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Description of one capability as presented to the model.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub description: &'static str,
    pub action: bool,
    pub input_schema: Value,
}

fn patch_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "target_margin": {
                "type": "string",
                "description": "Desired margin over cost, e.g. \"0.18\""
            },
            "min_margin": { "type": "string" },
            "skip_below": {
                "type": "string",
                "description": "Skip tasks with profit below this (USD)"
            },
            "reserve_floor": {
                "type": "string",
                "description": "Stop bidding below this balance (USD)"
            },
            "survival_mode": {
                "type": "string",
                "enum": ["growth", "survival", "desperate", "conservative"]
            },
            "clear_survival_mode": { "type": "boolean" },
            "cost_ceiling": { "type": "string" },
            "consecutive_loss_threshold": { "type": "integer", "minimum": 1 },
            "balance_floor_fraction": { "type": "number" },
            "qbr_frequency_rounds": { "type": "integer", "minimum": 1 },
            "default_partnership_split": { "type": "integer", "minimum": 1, "maximum": 99 }
        }
    })
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// The full, fixed capability set.
pub fn catalog() -> Vec<CapabilitySpec> {
    vec![
        CapabilitySpec {
            name: "get_market_snapshot",
            description: "Market state for your category: competitors, open tasks, recent \
                          winning prices, your rank, share and runway.",
            action: false,
            input_schema: empty_schema(),
        },
        CapabilitySpec {
            name: "search_agents",
            description: "Find potential partners, filtered by category and minimum reputation.",
            action: false,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent_type": {
                        "type": "string",
                        "enum": ["CATALOG", "REVIEW", "CURATION", "SELLER"]
                    },
                    "min_reputation": { "type": "number" },
                    "limit": { "type": "integer", "minimum": 1 }
                }
            }),
        },
        CapabilitySpec {
            name: "get_my_stats",
            description: "Your balance, reputation, win/loss record, streaks, runway and \
                          current policy.",
            action: false,
            input_schema: empty_schema(),
        },
        CapabilitySpec {
            name: "get_qbr_context",
            description: "Recent reviews, exceptions and the balance/reputation trend.",
            action: false,
            input_schema: empty_schema(),
        },
        CapabilitySpec {
            name: "get_partnerships",
            description: "Your partnerships and how they have performed.",
            action: false,
            input_schema: empty_schema(),
        },
        CapabilitySpec {
            name: "analyze_compatibility",
            description: "Compatibility between you and another agent, with a suggested split.",
            action: false,
            input_schema: json!({
                "type": "object",
                "properties": { "agent_id": { "type": "string" } },
                "required": ["agent_id"]
            }),
        },
        CapabilitySpec {
            name: "predict_policy_impact",
            description: "Preview how a policy change would alter a typical bid.",
            action: false,
            input_schema: json!({
                "type": "object",
                "properties": { "patch": patch_schema() },
                "required": ["patch"]
            }),
        },
        CapabilitySpec {
            name: "update_policy",
            description: "Apply a policy change. Reasoning is mandatory and stored verbatim.",
            action: true,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "patch": patch_schema(),
                    "reasoning": { "type": "string" }
                },
                "required": ["patch", "reasoning"]
            }),
        },
        CapabilitySpec {
            name: "propose_partnership",
            description: "Propose a revenue-sharing partnership. `split` is your percentage \
                          of joint profit.",
            action: true,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "target_agent_id": { "type": "string" },
                    "split": { "type": "integer", "minimum": 1, "maximum": 99 }
                },
                "required": ["target_agent_id"]
            }),
        },
        CapabilitySpec {
            name: "end_partnership",
            description: "End your partnership with another agent.",
            action: true,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "partner_agent_id": { "type": "string" },
                    "reason": { "type": "string" }
                },
                "required": ["partner_agent_id", "reason"]
            }),
        },
        CapabilitySpec {
            name: "record_transparency",
            description: "Publish a short note explaining your current strategy.",
            action: true,
            input_schema: json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"]
            }),
        },
    ]
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

const RECENT_PRICE_SAMPLE: usize = 20;
const TREND_ROUNDS: u64 = 10;

/// Read-only capability implementations.
pub struct Toolbox {
    store: SharedStore,
    living_cost: Decimal,
    auction: AuctionConfig,
}

impl Toolbox {
    pub fn new(store: SharedStore, living_cost: Decimal, auction: AuctionConfig) -> Self {
        Self {
            store,
            living_cost,
            auction,
        }
    }

    /// Run a query capability. Actions are rejected.
    pub async fn query(
        &self,
        agent: &Agent,
        policy: &Policy,
        round: u64,
        call: &Capability,
    ) -> Result<Value> {
        match call {
            Capability::GetMarketSnapshot {} => self.market_snapshot(agent).await,
            Capability::SearchAgents {
                agent_type,
                min_reputation,
                limit,
            } => {
                self.search_agents(agent, *agent_type, *min_reputation, limit.unwrap_or(5))
                    .await
            }
            Capability::GetMyStats {} => Ok(self.my_stats(agent, policy)),
            Capability::GetQbrContext {} => self.qbr_context(agent, round).await,
            Capability::GetPartnerships {} => self.partnerships(agent).await,
            Capability::AnalyzeCompatibility { agent_id } => {
                self.compatibility(agent, agent_id).await
            }
            Capability::PredictPolicyImpact { patch } => self.predict_impact(agent, policy, patch),
            other => Err(ArenaError::Validation(format!(
                "{} is an action, not a query",
                other.name()
            ))
            .into()),
        }
    }

    async fn market_snapshot(&self, agent: &Agent) -> Result<Value> {
        let mut peers: Vec<Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.agent_type == agent.agent_type && !a.is_dead())
            .collect();
        peers.sort_by(|a, b| b.balance.cmp(&a.balance).then_with(|| a.id.cmp(&b.id)));
        let rank = peers.iter().position(|a| a.id == agent.id).map(|p| p + 1);
        let total_wins: u64 = peers.iter().map(|a| a.bids_won).sum();
        let share = if total_wins == 0 {
            0.0
        } else {
            agent.bids_won as f64 / total_wins as f64
        };

        let open_tasks = self
            .store
            .tasks_with_status(TaskStatus::Open)
            .await?
            .into_iter()
            .filter(|t| t.task_type == agent.agent_type)
            .count();

        let mut won_tasks = Vec::new();
        for status in [TaskStatus::Assigned, TaskStatus::InProgress, TaskStatus::Completed] {
            won_tasks.extend(
                self.store
                    .tasks_with_status(status)
                    .await?
                    .into_iter()
                    .filter(|t| t.task_type == agent.agent_type),
            );
        }
        won_tasks.sort_by(|a, b| b.created_round.cmp(&a.created_round));
        let prices: Vec<Decimal> = won_tasks
            .iter()
            .filter_map(|t| t.winning_amount)
            .take(RECENT_PRICE_SAMPLE)
            .collect();
        let avg_price = if prices.is_empty() {
            None
        } else {
            let total: Decimal = prices.iter().copied().sum();
            Some((total / Decimal::from(prices.len() as u64)).round_dp(6))
        };

        Ok(json!({
            "category": agent.agent_type,
            "competitors": peers.len().saturating_sub(1),
            "open_tasks": open_tasks,
            "avg_winning_price": avg_price,
            "my_rank": rank,
            "my_win_share": share,
            "my_runway_rounds": agent.runway_rounds(self.living_cost),
            "my_cost_per_task": estimate_cost(agent.agent_type, agent.skill).total(),
        }))
    }

    async fn search_agents(
        &self,
        agent: &Agent,
        agent_type: Option<AgentType>,
        min_reputation: Option<f64>,
        limit: usize,
    ) -> Result<Value> {
        let mut found: Vec<Agent> = self
            .store
            .list_agents()
            .await?
            .into_iter()
            .filter(|a| a.id != agent.id && a.is_operating())
            .filter(|a| agent_type.map_or(true, |t| a.agent_type == t))
            .filter(|a| min_reputation.map_or(true, |r| a.reputation >= r))
            .collect();
        found.sort_by(|a, b| {
            b.reputation
                .partial_cmp(&a.reputation)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        let rows: Vec<Value> = found
            .iter()
            .take(limit.max(1))
            .map(|a| {
                json!({
                    "agent_id": a.id,
                    "name": a.name,
                    "agent_type": a.agent_type,
                    "reputation": a.reputation,
                    "balance": a.balance,
                    "win_rate": a.win_rate(),
                })
            })
            .collect();
        Ok(json!({ "agents": rows }))
    }

    fn my_stats(&self, agent: &Agent, policy: &Policy) -> Value {
        json!({
            "agent_id": agent.id,
            "status": agent.status,
            "balance": agent.balance,
            "peak_balance": agent.peak_balance,
            "reputation": agent.reputation,
            "bids_won": agent.bids_won,
            "bids_lost": agent.bids_lost,
            "win_rate": agent.win_rate(),
            "consecutive_wins": agent.consecutive_wins,
            "consecutive_losses": agent.consecutive_losses,
            "tasks_completed": agent.tasks_completed,
            "tasks_failed": agent.tasks_failed,
            "runway_rounds": agent.runway_rounds(self.living_cost),
            "policy_version": agent.policy_version,
            "policy": policy,
        })
    }

    async fn qbr_context(&self, agent: &Agent, round: u64) -> Result<Value> {
        let reviews = self.store.qbr_history(&agent.id, 3).await?;
        let exceptions = self.store.recent_exceptions(&agent.id, 5).await?;
        let trend = self
            .store
            .snapshots_for_agent(&agent.id, round.saturating_sub(TREND_ROUNDS), round)
            .await?;
        let (first, last) = (trend.first(), trend.last());
        Ok(json!({
            "previous_reviews": reviews.iter().map(|r| json!({
                "period": [r.period_start, r.period_end],
                "outcome": r.outcome,
                "win_rate": r.metrics.win_rate,
            })).collect::<Vec<_>>(),
            "recent_exceptions": exceptions.iter().map(|e| json!({
                "type": e.exception_type,
                "value": e.metric_value,
                "threshold": e.threshold,
                "round": e.detected_round,
                "resolved": e.resolved,
            })).collect::<Vec<_>>(),
            "trend": {
                "rounds": trend.len(),
                "balance_start": first.map(|s| s.balance),
                "balance_end": last.map(|s| s.balance),
                "reputation_start": first.map(|s| s.reputation),
                "reputation_end": last.map(|s| s.reputation),
                "won": trend.iter().map(|s| s.won).sum::<u32>(),
                "lost": trend.iter().map(|s| s.lost).sum::<u32>(),
            },
        }))
    }

    async fn partnerships(&self, agent: &Agent) -> Result<Value> {
        let rows: Vec<Value> = self
            .store
            .partnerships_for_agent(&agent.id)
            .await?
            .iter()
            .map(|p| {
                json!({
                    "partnership_id": p.id,
                    "partner_agent_id": p.counterpart(&agent.id),
                    "my_share": p.share_of(&agent.id),
                    "status": p.status,
                    "proposed_by_me": p.agent_a == agent.id,
                    "joint_revenue": p.joint_revenue,
                })
            })
            .collect();
        Ok(json!({ "partnerships": rows }))
    }

    async fn compatibility(&self, agent: &Agent, other_id: &str) -> Result<Value> {
        if other_id == agent.id {
            return Err(ArenaError::Partnership(
                "cannot analyse compatibility with yourself".into(),
            )
            .into());
        }
        let other = self
            .store
            .get_agent(other_id)
            .await?
            .ok_or_else(|| ArenaError::AgentNotFound(other_id.to_string()))?;
        let complementary = other.agent_type != agent.agent_type;
        let rep_gap = (agent.reputation - other.reputation).abs();
        let base = if complementary { 0.5 } else { 0.2 };
        let score = base + 0.5 * (1.0 - rep_gap / crate::types::REPUTATION_MAX);
        let suggested = (50.0 + (agent.reputation - other.reputation) * 10.0)
            .round()
            .clamp(30.0, 70.0) as u8;
        let existing = self
            .store
            .partnerships_for_agent(&agent.id)
            .await?
            .into_iter()
            .any(|p| p.involves(other_id) && p.status != PartnershipStatus::Ended);
        Ok(json!({
            "agent_id": other.id,
            "complementary": complementary,
            "reputation_gap": rep_gap,
            "compatibility": score,
            "suggested_split": suggested,
            "existing_partnership": existing,
        }))
    }

    fn predict_impact(&self, agent: &Agent, policy: &Policy, patch: &PolicyPatch) -> Result<Value> {
        let proposed = policy.apply_patch(patch)?;
        let cost = estimate_cost(agent.agent_type, agent.skill).total();
        let sample = crate::engine::tasks::sample_task(agent.agent_type, cost * Decimal::TWO);

        let outcome = |p: &Policy| {
            let bidder = BidderContext {
                agent: agent.clone(),
                policy: Some(p.clone()),
            };
            match BiddingService::evaluate(&bidder, &sample, 0) {
                Ok(bid) => json!({
                    "bid": bid.amount,
                    "margin": bid.snapshot.margin,
                    "score": score(&self.auction, agent.reputation, bid.amount),
                }),
                Err(reason) => json!({ "skipped": reason.to_string() }),
            }
        };

        Ok(json!({
            "sample_max_bid": sample.max_bid,
            "cost_basis": cost,
            "current": outcome(policy),
            "proposed": outcome(&proposed),
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
