//! Brain — bounded tool-calling loop that revises agent policies.
//!
//! A [`DecisionModel`] looks at an agent, the reason it was woken and the
//! results of earlier calls, and returns the capability calls it wants to
//! make next. The engine executes them against live state and feeds the
//! results back until an action lands or the iteration cap is hit.

pub mod anthropic;
pub mod engine;
pub mod rules;
pub mod tools;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::memory::MemoryContext;
use crate::policy::{Policy, TriggerKind, TriggerMeta};
use crate::types::{Agent, ExceptionRecord};

pub use engine::{DecisionOutcome, PolicyDecisionEngine, Wakeup};
pub use tools::{Capability, CapabilitySpec};

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// Why the brain was woken for an agent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    Exception { record: ExceptionRecord },
    Qbr { period_start: u64, period_end: u64 },
    PartnershipEvent { partnership_id: String, detail: String },
    InitialSetup,
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Exception { .. } => TriggerKind::Exception,
            Trigger::Qbr { .. } => TriggerKind::Qbr,
            Trigger::PartnershipEvent { .. } => TriggerKind::PartnershipEvent,
            Trigger::InitialSetup => TriggerKind::InitialSetup,
        }
    }

    /// Metadata stored with a policy version written under this trigger.
    pub fn meta(&self) -> TriggerMeta {
        match self {
            Trigger::Exception { record } => TriggerMeta {
                kind: TriggerKind::Exception,
                reference: Some(record.id.clone()),
                detail: Some(format!(
                    "{} value={:.4} threshold={:.4}",
                    record.exception_type, record.metric_value, record.threshold
                )),
            },
            Trigger::Qbr { period_start, period_end } => TriggerMeta {
                kind: TriggerKind::Qbr,
                reference: None,
                detail: Some(format!("rounds {period_start}-{period_end}")),
            },
            Trigger::PartnershipEvent { partnership_id, detail } => TriggerMeta {
                kind: TriggerKind::PartnershipEvent,
                reference: Some(partnership_id.clone()),
                detail: Some(detail.clone()),
            },
            Trigger::InitialSetup => TriggerMeta {
                kind: TriggerKind::InitialSetup,
                reference: None,
                detail: None,
            },
        }
    }

    /// One-line description for prompts and logs.
    pub fn describe(&self) -> String {
        match self {
            Trigger::Exception { record } => format!(
                "Exception {}: metric {:.4} breached threshold {:.4} in round {}",
                record.exception_type, record.metric_value, record.threshold, record.detected_round
            ),
            Trigger::Qbr { period_start, period_end } => {
                format!("Periodic business review covering rounds {period_start}-{period_end}")
            }
            Trigger::PartnershipEvent { detail, .. } => format!("Partnership event: {detail}"),
            Trigger::InitialSetup => "Initial policy setup".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Model contract
// ---------------------------------------------------------------------------

/// A capability call requested by the model. `input` is parsed by the
/// engine, so malformed calls come back to the model as error results.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// Result of one executed call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub ok: bool,
    pub content: Value,
}

/// One completed loop iteration.
#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub calls: Vec<ToolCall>,
    pub results: Vec<ToolResult>,
}

impl StepRecord {
    /// Result of the latest successful call to `name`, if any.
    pub fn result_of(&self, name: &str) -> Option<&Value> {
        self.results.iter().rev().find(|r| r.ok && r.name == name).map(|r| &r.content)
    }
}

/// Everything the model sees for one decision step.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub agent: Agent,
    /// Policy in force (stored, or the personality default).
    pub policy: Policy,
    pub trigger: Trigger,
    pub round: u64,
    pub memory: MemoryContext,
    pub capabilities: Vec<CapabilitySpec>,
    pub transcript: Vec<StepRecord>,
}

impl DecisionRequest {
    /// Latest successful result of `name` anywhere in the transcript.
    pub fn latest_result(&self, name: &str) -> Option<&Value> {
        self.transcript.iter().rev().find_map(|s| s.result_of(name))
    }
}

/// The model's answer for one step. No calls ends the loop.
#[derive(Debug, Clone, Default)]
pub struct DecisionStep {
    pub calls: Vec<ToolCall>,
    /// Free-form commentary, logged only.
    pub note: Option<String>,
}

/// Decision-reasoning collaborator.
#[async_trait]
pub trait DecisionModel: Send + Sync {
    async fn decide(&self, request: &DecisionRequest) -> Result<DecisionStep>;

    /// Model identifier string.
    fn model_name(&self) -> &str;
}
