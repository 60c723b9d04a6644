//! Deterministic rule-based decision model.
//!
//! Used when no LLM provider is configured and throughout the tests. The
//! first step gathers context; the second acts on the trigger and the loop
//! ends once that action has run.

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};

use super::{Capability, DecisionModel, DecisionRequest, DecisionStep, ToolCall, Trigger};
use crate::policy::{BiddingPolicy, Policy, PolicyPatch, SurvivalMode};
use crate::types::ExceptionType;

const LOSS_MARGIN_CUT: Decimal = dec!(0.8);
const QBR_MARGIN_CUT: Decimal = dec!(0.85);
const QBR_MARGIN_RAISE: Decimal = dec!(1.1);
const LOW_WIN_RATE: f64 = 0.3;
const HIGH_WIN_RATE: f64 = 0.6;
/// Balance below this fraction of peak is treated as desperate.
const DESPERATE_FRACTION: Decimal = dec!(0.25);
/// Balance at or above this fraction of peak counts as recovered.
const RECOVERED_FRACTION: Decimal = dec!(0.75);

#[derive(Debug, Default, Clone)]
pub struct RuleBasedModel;

impl RuleBasedModel {
    pub fn new() -> Self {
        Self
    }
}

fn call(step: usize, index: usize, cap: Capability) -> ToolCall {
    let input = serde_json::to_value(&cap)
        .ok()
        .and_then(|v| v.get("input").cloned())
        .unwrap_or_else(|| json!({}));
    ToolCall {
        id: format!("rules-{step}-{index}"),
        name: cap.name().to_string(),
        input,
    }
}

fn bidding_of(req: &DecisionRequest) -> BiddingPolicy {
    req.policy
        .bidding
        .clone()
        .unwrap_or_else(|| Policy::personality_bidding(req.agent.personality))
}

/// Scale the target margin, pulling the minimum down with it if needed.
fn scaled_margins(bidding: &BiddingPolicy, factor: Decimal) -> PolicyPatch {
    let target = (bidding.target_margin * factor).round_dp(4);
    PolicyPatch {
        target_margin: Some(target),
        min_margin: (bidding.min_margin > target).then_some(target),
        ..PolicyPatch::default()
    }
}

impl RuleBasedModel {
    fn gather(req: &DecisionRequest) -> Vec<Capability> {
        let mut caps = vec![Capability::GetMyStats {}];
        match &req.trigger {
            Trigger::Qbr { .. } => {
                caps.push(Capability::GetPartnerships {});
                caps.push(Capability::SearchAgents {
                    agent_type: None,
                    min_reputation: Some(3.5),
                    limit: Some(3),
                });
            }
            Trigger::Exception { .. } => caps.push(Capability::GetMarketSnapshot {}),
            _ => {}
        }
        caps
    }

    fn act(req: &DecisionRequest) -> Vec<Capability> {
        let bidding = bidding_of(req);
        let agent = &req.agent;
        match &req.trigger {
            Trigger::Exception { record } => {
                let (patch, reasoning) = match record.exception_type {
                    ExceptionType::ConsecutiveLosses | ExceptionType::WinRateDrop => {
                        let patch = scaled_margins(&bidding, LOSS_MARGIN_CUT);
                        let reasoning = format!(
                            "{} ({:.2} vs threshold {:.2}); bids are being undercut, so the \
                             target margin moves from {} to {}.",
                            record.exception_type,
                            record.metric_value,
                            record.threshold,
                            bidding.target_margin,
                            patch.target_margin.unwrap_or(bidding.target_margin),
                        );
                        (patch, reasoning)
                    }
                    ExceptionType::BalanceDrop => {
                        let mode = if agent.balance < agent.peak_balance * DESPERATE_FRACTION {
                            SurvivalMode::Desperate
                        } else {
                            SurvivalMode::Survival
                        };
                        let patch = PolicyPatch {
                            survival_mode: Some(mode),
                            ..PolicyPatch::default()
                        };
                        let reasoning = format!(
                            "Balance ${:.4} fell below the floor against a peak of ${:.4}; \
                             switching to {mode} mode to keep winning work.",
                            agent.balance, agent.peak_balance
                        );
                        (patch, reasoning)
                    }
                    ExceptionType::ReputationDrop => {
                        let patch = PolicyPatch {
                            survival_mode: Some(SurvivalMode::Conservative),
                            ..PolicyPatch::default()
                        };
                        let reasoning = format!(
                            "Reputation fell by {:.2}; bidding conservatively until it recovers.",
                            record.metric_value
                        );
                        (patch, reasoning)
                    }
                };
                vec![Capability::UpdatePolicy { patch, reasoning }]
            }
            Trigger::Qbr { period_start, period_end } => {
                let win_rate = req
                    .latest_result("get_my_stats")
                    .and_then(|v| v.get("win_rate"))
                    .and_then(Value::as_f64)
                    .unwrap_or_else(|| agent.win_rate());

                let mut patch = if win_rate < LOW_WIN_RATE {
                    scaled_margins(&bidding, QBR_MARGIN_CUT)
                } else if win_rate > HIGH_WIN_RATE {
                    scaled_margins(&bidding, QBR_MARGIN_RAISE)
                } else {
                    PolicyPatch::default()
                };
                let recovered = agent.balance >= agent.peak_balance * RECOVERED_FRACTION;
                if req.policy.survival_mode.is_some() && recovered {
                    patch.clear_survival_mode = true;
                }

                let mut caps = Vec::new();
                if !patch.is_empty() {
                    let reasoning = format!(
                        "Review of rounds {period_start}-{period_end}: win rate {:.0}%{}.",
                        win_rate * 100.0,
                        if patch.clear_survival_mode {
                            ", balance recovered so survival mode is lifted"
                        } else {
                            ""
                        }
                    );
                    caps.push(Capability::UpdatePolicy { patch, reasoning });
                }

                if let Some(target) = Self::partner_candidate(req) {
                    caps.push(Capability::ProposePartnership {
                        target_agent_id: target,
                        split: None,
                    });
                }

                if caps.is_empty() {
                    caps.push(Capability::RecordTransparency {
                        message: format!(
                            "Review of rounds {period_start}-{period_end}: win rate {:.0}%, \
                             keeping margin {}.",
                            win_rate * 100.0,
                            bidding.target_margin
                        ),
                    });
                }
                caps
            }
            Trigger::PartnershipEvent { detail, .. } => vec![Capability::RecordTransparency {
                message: format!("Noted partnership update: {detail}"),
            }],
            Trigger::InitialSetup => vec![Capability::RecordTransparency {
                message: format!(
                    "Starting as {} {} with target margin {}.",
                    agent.personality, agent.agent_type, bidding.target_margin
                ),
            }],
        }
    }

    /// A complementary agent to partner with, when the agent has no live
    /// partnership of its own.
    fn partner_candidate(req: &DecisionRequest) -> Option<String> {
        let partnerships = req.latest_result("get_partnerships")?.get("partnerships")?.as_array()?;
        let has_live = partnerships.iter().any(|p| {
            matches!(
                p.get("status").and_then(Value::as_str),
                Some("PROPOSED" | "ACTIVE")
            )
        });
        if has_live {
            return None;
        }
        let own_type = req.agent.agent_type.as_str();
        req.latest_result("search_agents")?
            .get("agents")?
            .as_array()?
            .iter()
            .find(|a| a.get("agent_type").and_then(Value::as_str) != Some(own_type))
            .and_then(|a| a.get("agent_id")?.as_str().map(str::to_string))
    }
}

#[async_trait]
impl DecisionModel for RuleBasedModel {
    async fn decide(&self, request: &DecisionRequest) -> Result<DecisionStep> {
        let step = request.transcript.len();
        let acted = request
            .transcript
            .last()
            .map(|s| {
                s.calls.iter().any(|c| {
                    Capability::parse(&c.name, &c.input).map_or(false, |cap| cap.is_action())
                })
            })
            .unwrap_or(false);
        if acted || step >= 2 {
            return Ok(DecisionStep::default());
        }

        let caps = if step == 0 { Self::gather(request) } else { Self::act(request) };
        Ok(DecisionStep {
            calls: caps.into_iter().enumerate().map(|(i, cap)| call(step, i, cap)).collect(),
            note: Some(request.trigger.describe()),
        })
    }

    fn model_name(&self) -> &str {
        "rules"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::{tools, StepRecord, ToolResult};
    use crate::memory::MemoryContext;
    use crate::types::{Agent, AgentType, ExceptionRecord, Personality};

    fn request(trigger: Trigger) -> DecisionRequest {
        let mut agent = Agent::new("cat-1", "Cat", AgentType::Catalog, Personality::Balanced);
        agent.balance = dec!(0.04);
        agent.peak_balance = dec!(0.10);
        DecisionRequest {
            agent,
            policy: Policy::from_personality(Personality::Balanced),
            trigger,
            round: 12,
            memory: MemoryContext::default(),
            capabilities: tools::catalog(),
            transcript: vec![],
        }
    }

    fn record_step(req: &mut DecisionRequest, step: DecisionStep, results: Vec<(&str, Value)>) {
        let results = results
            .into_iter()
            .map(|(name, content)| ToolResult {
                call_id: format!("{name}-id"),
                name: name.to_string(),
                ok: true,
                content,
            })
            .collect();
        req.transcript.push(StepRecord {
            calls: step.calls,
            results,
        });
    }

    #[tokio::test]
    async fn test_loss_streak_cuts_margin() {
        let model = RuleBasedModel::new();
        let exc = ExceptionRecord::new("cat-1", ExceptionType::ConsecutiveLosses, 5.0, 5.0, 12);
        let mut req = request(Trigger::Exception { record: exc });

        let first = model.decide(&req).await.unwrap();
        let names: Vec<_> = first.calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["get_my_stats", "get_market_snapshot"]);
        record_step(&mut req, first, vec![("get_my_stats", json!({ "win_rate": 0.2 }))]);

        let second = model.decide(&req).await.unwrap();
        assert_eq!(second.calls.len(), 1);
        match Capability::parse(&second.calls[0].name, &second.calls[0].input).unwrap() {
            Capability::UpdatePolicy { patch, reasoning } => {
                assert_eq!(patch.target_margin, Some(dec!(0.16)));
                assert_eq!(patch.min_margin, None);
                assert!(reasoning.contains("CONSECUTIVE_LOSSES"));
            }
            other => panic!("unexpected {other:?}"),
        }
        record_step(&mut req, second, vec![("update_policy", json!({ "version": 2 }))]);
        assert!(model.decide(&req).await.unwrap().calls.is_empty());
    }

    #[tokio::test]
    async fn test_balance_drop_enters_survival() {
        let model = RuleBasedModel::new();
        let exc = ExceptionRecord::new("cat-1", ExceptionType::BalanceDrop, 0.04, 0.05, 12);
        let mut req = request(Trigger::Exception { record: exc });
        let first = model.decide(&req).await.unwrap();
        record_step(&mut req, first, vec![]);
        let second = model.decide(&req).await.unwrap();
        match Capability::parse(&second.calls[0].name, &second.calls[0].input).unwrap() {
            Capability::UpdatePolicy { patch, .. } => {
                assert_eq!(patch.survival_mode, Some(SurvivalMode::Survival));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_qbr_proposes_complementary_partner() {
        let model = RuleBasedModel::new();
        let mut req = request(Trigger::Qbr { period_start: 2, period_end: 11 });
        let first = model.decide(&req).await.unwrap();
        assert_eq!(first.calls.len(), 3);
        record_step(
            &mut req,
            first,
            vec![
                ("get_my_stats", json!({ "win_rate": 0.45 })),
                ("get_partnerships", json!({ "partnerships": [] })),
                (
                    "search_agents",
                    json!({ "agents": [
                        { "agent_id": "cat-2", "agent_type": "CATALOG" },
                        { "agent_id": "rev-1", "agent_type": "REVIEW" }
                    ] }),
                ),
            ],
        );
        let second = model.decide(&req).await.unwrap();
        assert_eq!(second.calls.len(), 1);
        assert_eq!(second.calls[0].name, "propose_partnership");
        assert_eq!(second.calls[0].input["target_agent_id"], json!("rev-1"));
    }

    #[tokio::test]
    async fn test_quiet_qbr_records_transparency() {
        let model = RuleBasedModel::new();
        let mut req = request(Trigger::Qbr { period_start: 2, period_end: 11 });
        let first = model.decide(&req).await.unwrap();
        record_step(
            &mut req,
            first,
            vec![
                ("get_my_stats", json!({ "win_rate": 0.5 })),
                ("get_partnerships", json!({ "partnerships": [{ "status": "ACTIVE" }] })),
            ],
        );
        let second = model.decide(&req).await.unwrap();
        assert_eq!(second.calls[0].name, "record_transparency");
    }
}
