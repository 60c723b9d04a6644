//! PolicyDecisionEngine — runs the bounded capability loop for one agent
//! and executes the actions it asks for.

use anyhow::Result;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::tools::{catalog, Toolbox};
use super::{Capability, DecisionModel, DecisionRequest, StepRecord, ToolCall, ToolResult, Trigger};
use crate::config::{AuctionConfig, BrainConfig};
use crate::engine::economy::EconomyService;
use crate::engine::exceptions::ExceptionDetector;
use crate::memory::MemoryService;
use crate::policy::{Policy, PolicyPatch, PolicyVersion, TriggerKind};
use crate::storage::SharedStore;
use crate::types::{
    Agent, ArenaError, Consent, LedgerEntry, LedgerKind, MemoryKind, Partnership,
    PartnershipStatus, QbrMetrics, QbrRecord,
};

/// A request to run the loop for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct Wakeup {
    pub agent_id: String,
    pub trigger: Trigger,
}

impl Wakeup {
    pub fn new(agent_id: impl Into<String>, trigger: Trigger) -> Self {
        Self {
            agent_id: agent_id.into(),
            trigger,
        }
    }

    /// Ledger reference claiming this wakeup for its round.
    fn claim_reference(&self) -> String {
        match &self.trigger {
            Trigger::PartnershipEvent { partnership_id, .. } => {
                format!("partnership-{partnership_id}")
            }
            Trigger::InitialSetup => "setup".to_string(),
            Trigger::Exception { .. } | Trigger::Qbr { .. } => "wakeup".to_string(),
        }
    }
}

/// What one wakeup did. Failures are recorded here, never propagated.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub agent_id: String,
    pub trigger: TriggerKind,
    pub model: String,
    pub iterations: usize,
    /// Every call made, in order.
    pub calls: Vec<String>,
    /// Actions that succeeded.
    pub actions: Vec<String>,
    pub new_policy_version: Option<u32>,
    /// The wakeup had already run this round.
    pub skipped: bool,
    pub error: Option<String>,
    /// Counterparts to notify after this wakeup.
    #[serde(skip)]
    pub follow_ups: Vec<Wakeup>,
}

impl DecisionOutcome {
    fn new(wakeup: &Wakeup, model: &str) -> Self {
        Self {
            agent_id: wakeup.agent_id.clone(),
            trigger: wakeup.trigger.kind(),
            model: model.to_string(),
            iterations: 0,
            calls: Vec::new(),
            actions: Vec::new(),
            new_policy_version: None,
            skipped: false,
            error: None,
            follow_ups: Vec::new(),
        }
    }
}

pub struct PolicyDecisionEngine {
    store: SharedStore,
    economy: Arc<EconomyService>,
    detector: Arc<ExceptionDetector>,
    memory: Arc<MemoryService>,
    model: Arc<dyn DecisionModel>,
    toolbox: Toolbox,
    cfg: BrainConfig,
}

impl PolicyDecisionEngine {
    pub fn new(
        store: SharedStore,
        economy: Arc<EconomyService>,
        detector: Arc<ExceptionDetector>,
        memory: Arc<MemoryService>,
        model: Arc<dyn DecisionModel>,
        auction: AuctionConfig,
        cfg: BrainConfig,
    ) -> Self {
        let toolbox = Toolbox::new(store.clone(), economy.config().living_cost, auction);
        Self {
            store,
            economy,
            detector,
            memory,
            model,
            toolbox,
            cfg,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Latest stored policy, or the personality default when none exists.
    pub async fn current_policy(&self, agent: &Agent) -> Result<Policy> {
        Ok(match self.store.latest_policy(&agent.id).await? {
            Some(v) => v.policy,
            None => Policy::from_personality(agent.personality),
        })
    }

    async fn load_agent(&self, agent_id: &str) -> Result<Agent> {
        self.store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| ArenaError::AgentNotFound(agent_id.to_string()).into())
    }

    // -----------------------------------------------------------------------
    // Wakeups
    // -----------------------------------------------------------------------

    /// Run one wakeup. Claimed once per round through the ledger; every
    /// failure is logged and folded into the outcome.
    pub async fn wake(&self, wakeup: &Wakeup, round: u64) -> DecisionOutcome {
        let mut outcome = DecisionOutcome::new(wakeup, self.model.model_name());

        let claim = LedgerEntry::new(
            round,
            &wakeup.agent_id,
            LedgerKind::DecisionClaim,
            wakeup.claim_reference(),
            Decimal::ZERO,
        );
        match self.economy.apply(claim, |_| {}).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(
                    round,
                    agent_id = %wakeup.agent_id,
                    trigger = %outcome.trigger,
                    "Wakeup already claimed"
                );
                outcome.skipped = true;
                return outcome;
            }
            Err(e) => {
                warn!(round, agent_id = %wakeup.agent_id, error = %e, "Could not claim wakeup");
                outcome.error = Some(format!("{e:#}"));
                return outcome;
            }
        }

        if let Err(e) = self.run_loop(wakeup, round, &mut outcome).await {
            warn!(
                round,
                agent_id = %wakeup.agent_id,
                trigger = %outcome.trigger,
                error = %e,
                "Decision loop failed"
            );
            outcome.error.get_or_insert_with(|| format!("{e:#}"));
        }

        if let Trigger::Qbr {
            period_start,
            period_end,
        } = &wakeup.trigger
        {
            if let Err(e) = self
                .close_review(&wakeup.agent_id, *period_start, *period_end, round, &outcome)
                .await
            {
                warn!(round, agent_id = %wakeup.agent_id, error = %e, "Could not record review");
                outcome.error.get_or_insert_with(|| format!("{e:#}"));
            }
        }

        info!(
            round,
            agent_id = %outcome.agent_id,
            trigger = %outcome.trigger,
            iterations = outcome.iterations,
            actions = ?outcome.actions,
            policy_version = ?outcome.new_policy_version,
            "Decision complete"
        );
        outcome
    }

    /// Run independent wakeups concurrently (bounded by `max_concurrent`),
    /// then one pass of counterpart notifications they produced.
    pub async fn wake_many(&self, wakeups: Vec<Wakeup>, round: u64) -> Vec<DecisionOutcome> {
        let mut outcomes = self.run_batch(wakeups, round).await;
        let follow_ups: Vec<Wakeup> = outcomes
            .iter_mut()
            .flat_map(|o| std::mem::take(&mut o.follow_ups))
            .collect();
        if !follow_ups.is_empty() {
            debug!(round, count = follow_ups.len(), "Running partnership notifications");
            let mut notified = self.run_batch(follow_ups, round).await;
            for o in &mut notified {
                o.follow_ups.clear();
            }
            outcomes.extend(notified);
        }
        outcomes
    }

    async fn run_batch(&self, wakeups: Vec<Wakeup>, round: u64) -> Vec<DecisionOutcome> {
        let mut outcomes: Vec<DecisionOutcome> = stream::iter(wakeups)
            .map(|w| async move { self.wake(&w, round).await })
            .buffer_unordered(self.cfg.max_concurrent.max(1))
            .collect()
            .await;
        outcomes.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        outcomes
    }

    async fn run_loop(
        &self,
        wakeup: &Wakeup,
        round: u64,
        outcome: &mut DecisionOutcome,
    ) -> Result<()> {
        let agent = self.load_agent(&wakeup.agent_id).await?;
        let policy = self.current_policy(&agent).await?;
        let memory = self.memory.context(&agent.id).await?;
        let mut req = DecisionRequest {
            agent,
            policy,
            trigger: wakeup.trigger.clone(),
            round,
            memory,
            capabilities: catalog(),
            transcript: Vec::new(),
        };
        let step_timeout = Duration::from_secs(self.cfg.step_timeout_secs);

        for iteration in 0..self.cfg.max_iterations {
            outcome.iterations = iteration + 1;
            let step = match tokio::time::timeout(step_timeout, self.model.decide(&req)).await {
                Ok(Ok(step)) => step,
                Ok(Err(e)) => {
                    warn!(
                        round,
                        agent_id = %req.agent.id,
                        trigger = %outcome.trigger,
                        error = %e,
                        "Decision step failed"
                    );
                    outcome.error = Some(format!("{e:#}"));
                    break;
                }
                Err(_) => {
                    warn!(
                        round,
                        agent_id = %req.agent.id,
                        trigger = %outcome.trigger,
                        timeout_secs = self.cfg.step_timeout_secs,
                        "Decision step timed out"
                    );
                    outcome.error = Some(format!(
                        "decision step timed out after {}s",
                        self.cfg.step_timeout_secs
                    ));
                    break;
                }
            };
            if let Some(note) = &step.note {
                debug!(agent_id = %req.agent.id, note = %note, "Model note");
            }
            if step.calls.is_empty() {
                break;
            }

            let mut results = Vec::with_capacity(step.calls.len());
            let mut acted = false;
            for call in &step.calls {
                outcome.calls.push(call.name.clone());
                let result = self.execute(&mut req, wakeup, call, outcome).await;
                let is_action = Capability::parse(&call.name, &call.input)
                    .map_or(false, |c| c.is_action());
                if result.ok && is_action {
                    acted = true;
                    outcome.actions.push(call.name.clone());
                }
                results.push(result);
            }
            req.transcript.push(StepRecord {
                calls: step.calls,
                results,
            });
            if acted {
                break;
            }
        }
        Ok(())
    }

    /// Execute one call against live state. Errors become error results.
    async fn execute(
        &self,
        req: &mut DecisionRequest,
        wakeup: &Wakeup,
        call: &ToolCall,
        outcome: &mut DecisionOutcome,
    ) -> ToolResult {
        let result = match Capability::parse(&call.name, &call.input) {
            Ok(cap) if cap.is_action() => self.act(req, wakeup, cap, outcome).await,
            Ok(cap) => self.toolbox.query(&req.agent, &req.policy, req.round, &cap).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(content) => ToolResult {
                call_id: call.id.clone(),
                name: call.name.clone(),
                ok: true,
                content,
            },
            Err(e) => {
                debug!(
                    agent_id = %req.agent.id,
                    call = %call.name,
                    error = %e,
                    "Capability call failed"
                );
                ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    ok: false,
                    content: json!({ "error": format!("{e:#}") }),
                }
            }
        }
    }

    async fn act(
        &self,
        req: &mut DecisionRequest,
        wakeup: &Wakeup,
        cap: Capability,
        outcome: &mut DecisionOutcome,
    ) -> Result<Value> {
        let round = req.round;
        let value = match cap {
            Capability::UpdatePolicy { patch, reasoning } => {
                let (version, value) = self
                    .update_policy(&req.agent.id, &patch, &reasoning, &wakeup.trigger, round)
                    .await?;
                outcome.new_policy_version = Some(version);
                req.policy = self.current_policy(&req.agent).await?;
                value
            }
            Capability::ProposePartnership { target_agent_id, split } => {
                let (value, notify) = self
                    .propose_partnership(&req.agent, &req.policy, &target_agent_id, split, round)
                    .await?;
                outcome.follow_ups.push(notify);
                value
            }
            Capability::EndPartnership {
                partner_agent_id,
                reason,
            } => {
                let (value, notify) = self
                    .end_partnership(&req.agent.id, &partner_agent_id, &reason, round)
                    .await?;
                outcome.follow_ups.push(notify);
                value
            }
            Capability::RecordTransparency { message } => {
                self.record_transparency(&req.agent.id, &message, round)
                    .await?
            }
            other => {
                return Err(ArenaError::Validation(format!(
                    "{} is a query, not an action",
                    other.name()
                ))
                .into());
            }
        };
        req.agent = self.load_agent(&req.agent.id).await?;
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Actions
    // -----------------------------------------------------------------------

    /// Validate and append the next policy version, then charge for it.
    /// Returns the new version number.
    pub async fn update_policy(
        &self,
        agent_id: &str,
        patch: &PolicyPatch,
        reasoning: &str,
        trigger: &Trigger,
        round: u64,
    ) -> Result<(u32, Value)> {
        if reasoning.trim().is_empty() {
            return Err(ArenaError::InvalidPolicy("reasoning must not be empty".into()).into());
        }
        let agent = self.load_agent(agent_id).await?;
        let (current, version) = match self.store.latest_policy(agent_id).await? {
            Some(v) => (v.policy, v.version),
            None => (Policy::from_personality(agent.personality), 0),
        };
        let next = current.apply_patch(patch)?;
        let new_version = version + 1;

        self.store
            .append_policy_version(&PolicyVersion {
                agent_id: agent_id.to_string(),
                version: new_version,
                policy: next,
                reasoning: reasoning.to_string(),
                trigger: trigger.meta(),
                round,
                created_at: Utc::now(),
            })
            .await?;

        let charged = self.economy.charge_decision_cost(round, agent_id, new_version).await?;
        let resolved = self.detector.resolve_for_agent(agent_id, round).await?;
        self.memory
            .record(
                agent_id,
                MemoryKind::Learning,
                format!("Policy v{new_version} ({}): {reasoning}", trigger.kind()),
                round,
                0.8,
            )
            .await?;

        info!(
            round,
            agent_id,
            version = new_version,
            trigger = %trigger.kind(),
            resolved_exceptions = resolved,
            "Policy updated"
        );
        Ok((
            new_version,
            json!({
                "version": new_version,
                "resolved_exceptions": resolved,
                "balance": charged.map(|a| a.balance),
            }),
        ))
    }

    /// Record a proposal and let the counterpart's own rules decide it.
    pub async fn propose_partnership(
        &self,
        proposer: &Agent,
        policy: &Policy,
        target_id: &str,
        split: Option<u8>,
        round: u64,
    ) -> Result<(Value, Wakeup)> {
        if target_id == proposer.id {
            return Err(
                ArenaError::Partnership("an agent cannot partner with itself".into()).into(),
            );
        }
        let target = self.load_agent(target_id).await?;
        if target.is_dead() {
            return Err(ArenaError::Partnership(format!("{target_id} is dead")).into());
        }
        let existing = self.store.partnerships_for_agent(&proposer.id).await?;
        if existing.iter().any(|p| p.involves(target_id) && p.is_live()) {
            return Err(
                ArenaError::Partnership(format!("already partnered with {target_id}")).into(),
            );
        }
        let split = split.unwrap_or(policy.partnership_rules().default_split);
        if split == 0 || split >= 100 {
            return Err(ArenaError::Partnership(format!(
                "split must be within 1–99, got {split}"
            ))
            .into());
        }

        let mut partnership = Partnership {
            id: uuid::Uuid::new_v4().to_string(),
            agent_a: proposer.id.clone(),
            agent_b: target_id.to_string(),
            split_a: split,
            status: PartnershipStatus::Proposed,
            consent: Consent {
                a_accepted: true,
                b_accepted: false,
            },
            proposed_round: round,
            ended_round: None,
            end_reason: None,
            joint_revenue: Decimal::ZERO,
            created_at: Utc::now(),
        };
        self.store.insert_partnership(&partnership).await?;

        let rules = self.current_policy(&target).await?.partnership_rules();
        let offered = 100 - split;
        if matches!(rules.auto_reject_below_split, Some(floor) if offered < floor) {
            partnership.status = PartnershipStatus::Ended;
            partnership.ended_round = Some(round);
            partnership.end_reason = Some(format!("auto-rejected: offered {offered}% share"));
        } else {
            let rep_ok = rules.auto_accept_min_reputation.map(|min| proposer.reputation >= min);
            let split_ok = rules.auto_accept_min_split.map(|min| offered >= min);
            let accept = (rep_ok.is_some() || split_ok.is_some())
                && rep_ok != Some(false)
                && split_ok != Some(false);
            if accept {
                partnership.status = PartnershipStatus::Active;
                partnership.consent.b_accepted = true;
            }
        }
        if partnership.status != PartnershipStatus::Proposed {
            self.store.save_partnership(&partnership).await?;
        }

        info!(
            round,
            proposer = %proposer.id,
            target = target_id,
            split,
            status = ?partnership.status,
            "Partnership proposed"
        );
        let notify = Wakeup::new(
            target_id,
            Trigger::PartnershipEvent {
                partnership_id: partnership.id.clone(),
                detail: format!(
                    "{} proposed a {split}/{offered} split; status {:?}",
                    proposer.id, partnership.status
                ),
            },
        );
        Ok((
            json!({
                "partnership_id": partnership.id,
                "status": partnership.status,
                "my_share": split,
                "end_reason": partnership.end_reason,
            }),
            notify,
        ))
    }

    pub async fn end_partnership(
        &self,
        agent_id: &str,
        partner_id: &str,
        reason: &str,
        round: u64,
    ) -> Result<(Value, Wakeup)> {
        if reason.trim().is_empty() {
            return Err(ArenaError::Partnership(
                "a reason is required to end a partnership".into(),
            )
            .into());
        }
        let mut partnership = self
            .store
            .partnerships_for_agent(agent_id)
            .await?
            .into_iter()
            .find(|p| p.involves(partner_id) && p.is_live())
            .ok_or_else(|| {
                ArenaError::Partnership(format!("no live partnership with {partner_id}"))
            })?;

        partnership.status = PartnershipStatus::Ended;
        partnership.ended_round = Some(round);
        partnership.end_reason = Some(reason.to_string());
        self.store.save_partnership(&partnership).await?;

        info!(round, agent_id, partner = partner_id, "Partnership ended");
        let notify = Wakeup::new(
            partner_id,
            Trigger::PartnershipEvent {
                partnership_id: partnership.id.clone(),
                detail: format!("{agent_id} ended the partnership: {reason}"),
            },
        );
        Ok((
            json!({ "partnership_id": partnership.id, "status": partnership.status }),
            notify,
        ))
    }

    pub async fn record_transparency(
        &self,
        agent_id: &str,
        message: &str,
        round: u64,
    ) -> Result<Value> {
        if message.trim().is_empty() {
            return Err(ArenaError::Validation(
                "transparency message must not be empty".into(),
            )
            .into());
        }
        let memory = self
            .memory
            .record(agent_id, MemoryKind::Transparency, message, round, 0.3)
            .await?;
        Ok(json!({ "recorded": true, "memory_id": memory.id }))
    }

    // -----------------------------------------------------------------------
    // Reviews
    // -----------------------------------------------------------------------

    /// Write the review record and schedule the next one.
    async fn close_review(
        &self,
        agent_id: &str,
        period_start: u64,
        period_end: u64,
        round: u64,
        outcome: &DecisionOutcome,
    ) -> Result<()> {
        let agent = self.load_agent(agent_id).await?;
        let policy = self.current_policy(&agent).await?;
        let snapshots = self.store.snapshots_for_agent(agent_id, period_start, period_end).await?;
        let exceptions = self.store.recent_exceptions(agent_id, 100).await?;

        let bids_won: u64 = snapshots.iter().map(|s| s.won as u64).sum();
        let bids_lost: u64 = snapshots.iter().map(|s| s.lost as u64).sum();
        let resolved = bids_won + bids_lost;
        let metrics = QbrMetrics {
            balance_start: snapshots.first().map_or(agent.balance, |s| s.balance),
            balance_end: agent.balance,
            reputation_start: snapshots.first().map_or(agent.reputation, |s| s.reputation),
            reputation_end: agent.reputation,
            bids_won,
            bids_lost,
            win_rate: if resolved == 0 { 0.0 } else { bids_won as f64 / resolved as f64 },
            exceptions_raised: exceptions
                .iter()
                .filter(|e| (period_start..=period_end).contains(&e.detected_round))
                .count() as u64,
        };

        let next_review_round = ExceptionDetector::next_review_round(&agent, Some(&policy), round);
        let summary = format!(
            "Win rate {:.0}% ({}W/{}L), balance ${:.4} -> ${:.4}, {} exception(s); {}",
            metrics.win_rate * 100.0,
            bids_won,
            bids_lost,
            metrics.balance_start,
            metrics.balance_end,
            metrics.exceptions_raised,
            match (&outcome.error, outcome.actions.is_empty()) {
                (Some(_), _) => "review incomplete".to_string(),
                (None, true) => "no changes".to_string(),
                (None, false) => format!("took {}", outcome.actions.join(", ")),
            }
        );
        let record = QbrRecord {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            period_start,
            period_end,
            metrics,
            decisions: outcome.actions.clone(),
            outcome: summary.clone(),
            next_review_round,
            created_at: Utc::now(),
        };
        self.store.insert_qbr(&record).await?;
        self.economy
            .amend(agent_id, |a| a.next_qbr_round = next_review_round)
            .await?;
        self.memory
            .record(
                agent_id,
                MemoryKind::QbrInsight,
                format!("Review r{period_start}-r{period_end}: {summary}"),
                round,
                0.7,
            )
            .await?;
        debug!(round, agent_id, next_review_round, "Review recorded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::rules::RuleBasedModel;
    use crate::brain::DecisionStep;
    use crate::config::{EconomyConfig, ExceptionsConfig};
    use crate::storage::memory::MemoryStore;
    use crate::storage::ArenaStore;
    use crate::types::{AgentStatus, AgentType, ExceptionRecord, ExceptionType, Personality};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed list of steps, then stops.
    struct ScriptedModel {
        steps: Mutex<VecDeque<Vec<(&'static str, Value)>>>,
    }

    impl ScriptedModel {
        fn new(steps: Vec<Vec<(&'static str, Value)>>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
            }
        }
    }

    #[async_trait]
    impl DecisionModel for ScriptedModel {
        async fn decide(&self, req: &DecisionRequest) -> Result<DecisionStep> {
            let next = self.steps.lock().unwrap().pop_front().unwrap_or_default();
            Ok(DecisionStep {
                calls: next
                    .into_iter()
                    .enumerate()
                    .map(|(i, (name, input))| ToolCall {
                        id: format!("s{}-{i}", req.transcript.len()),
                        name: name.to_string(),
                        input,
                    })
                    .collect(),
                note: None,
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct SlowModel;

    #[async_trait]
    impl DecisionModel for SlowModel {
        async fn decide(&self, _req: &DecisionRequest) -> Result<DecisionStep> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(DecisionStep::default())
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    async fn seed(store: &MemoryStore, id: &str, agent_type: AgentType, balance: Decimal) {
        let mut a = Agent::new(id, id, agent_type, Personality::Balanced);
        a.status = AgentStatus::Active;
        a.balance = balance;
        a.peak_balance = balance;
        store.insert_agent(&a).await.unwrap();
    }

    fn engine(store: Arc<MemoryStore>, model: Arc<dyn DecisionModel>) -> PolicyDecisionEngine {
        let economy = Arc::new(EconomyService::new(store.clone(), EconomyConfig::default()));
        let detector = Arc::new(ExceptionDetector::new(store.clone(), ExceptionsConfig::default()));
        let memory = Arc::new(MemoryService::new(store.clone()));
        PolicyDecisionEngine::new(
            store,
            economy,
            detector,
            memory,
            model,
            AuctionConfig::default(),
            BrainConfig {
                step_timeout_secs: 5,
                ..BrainConfig::default()
            },
        )
    }

    async fn append_versions(store: &MemoryStore, agent_id: &str, count: u32) {
        for v in 1..=count {
            store
                .append_policy_version(&PolicyVersion {
                    agent_id: agent_id.to_string(),
                    version: v,
                    policy: Policy::from_personality(Personality::Balanced),
                    reasoning: format!("v{v}"),
                    trigger: Trigger::InitialSetup.meta(),
                    round: 0,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        let mut a = store.get_agent(agent_id).await.unwrap().unwrap();
        a.policy_version = count;
        store.save_agent(&a).await.unwrap();
    }

    #[tokio::test]
    async fn test_exception_wakeup_writes_next_version() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        append_versions(&store, "cat-1", 3).await;
        let record = ExceptionRecord::new("cat-1", ExceptionType::ConsecutiveLosses, 5.0, 5.0, 12);
        store.insert_exception(&record).await.unwrap();

        let brain = engine(store.clone(), Arc::new(RuleBasedModel::new()));
        let outcome = brain
            .wake(&Wakeup::new("cat-1", Trigger::Exception { record: record.clone() }), 12)
            .await;
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.new_policy_version, Some(4));
        assert_eq!(outcome.actions, vec!["update_policy"]);
        assert_eq!(outcome.iterations, 2);

        let latest = store.latest_policy("cat-1").await.unwrap().unwrap();
        assert_eq!(latest.version, 4);
        assert!(!latest.reasoning.is_empty());
        assert_eq!(latest.trigger.kind, TriggerKind::Exception);
        assert_eq!(latest.trigger.reference.as_deref(), Some(record.id.as_str()));
        assert_eq!(latest.policy.bidding.unwrap().target_margin, dec!(0.16));

        let agent = store.get_agent("cat-1").await.unwrap().unwrap();
        assert_eq!(agent.policy_version, 4);
        assert_eq!(agent.balance, dec!(0.047));
        assert!(store.open_exceptions(Some("cat-1")).await.unwrap().is_empty());
        let learnings = store.memories_for_agent("cat-1", 10).await.unwrap();
        assert!(learnings.iter().any(|m| m.kind == MemoryKind::Learning));
    }

    #[tokio::test]
    async fn test_wakeup_claimed_once_per_round() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        let brain = engine(store.clone(), Arc::new(RuleBasedModel::new()));
        let record = ExceptionRecord::new("cat-1", ExceptionType::ReputationDrop, 0.6, 0.5, 4);
        let wakeup = Wakeup::new("cat-1", Trigger::Exception { record });

        let first = brain.wake(&wakeup, 4).await;
        let second = brain.wake(&wakeup, 4).await;
        assert!(!first.skipped);
        assert!(second.skipped);
        assert_eq!(store.policy_history("cat-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_decision_cost_clamped_at_zero() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.001)).await;
        let brain = engine(store.clone(), Arc::new(RuleBasedModel::new()));
        let (version, _) = tokio_test::assert_ok!(
            brain
                .update_policy(
                    "cat-1",
                    &PolicyPatch {
                        target_margin: Some(dec!(0.15)),
                        ..PolicyPatch::default()
                    },
                    "cheaper bids",
                    &Trigger::InitialSetup,
                    1,
                )
                .await
        );
        assert_eq!(version, 1);
        let agent = store.get_agent("cat-1").await.unwrap().unwrap();
        assert_eq!(agent.balance, Decimal::ZERO);
        let ledger = store.ledger_for_agent("cat-1").await.unwrap();
        assert_eq!(ledger[0].amount, dec!(-0.001));
    }

    #[tokio::test]
    async fn test_invalid_update_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        let brain = engine(store.clone(), Arc::new(RuleBasedModel::new()));
        let patch = PolicyPatch {
            target_margin: Some(dec!(0.15)),
            ..PolicyPatch::default()
        };
        tokio_test::assert_err!(
            brain
                .update_policy("cat-1", &patch, "  ", &Trigger::InitialSetup, 1)
                .await
        );
        let bad = PolicyPatch {
            target_margin: Some(dec!(0.01)),
            ..PolicyPatch::default()
        };
        tokio_test::assert_err!(
            brain
                .update_policy("cat-1", &bad, "too low", &Trigger::InitialSetup, 1)
                .await
        );
        assert!(store.policy_history("cat-1").await.unwrap().is_empty());
        assert_eq!(store.get_agent("cat-1").await.unwrap().unwrap().balance, dec!(0.05));
    }

    #[tokio::test]
    async fn test_failed_call_does_not_abort_loop() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        let model = ScriptedModel::new(vec![
            vec![
                ("teleport", json!({})),
                ("update_policy", json!({ "patch": {}, "reasoning": "x" })),
            ],
            vec![("record_transparency", json!({ "message": "holding steady" }))],
            vec![("get_my_stats", json!({}))],
        ]);
        let brain = engine(store.clone(), Arc::new(model));
        let outcome = brain.wake(&Wakeup::new("cat-1", Trigger::InitialSetup), 1).await;
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.calls, vec!["teleport", "update_policy", "record_transparency"]);
        assert_eq!(outcome.actions, vec!["record_transparency"]);
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        let steps = (0..10).map(|_| vec![("get_my_stats", json!({}))]).collect();
        let brain = engine(store.clone(), Arc::new(ScriptedModel::new(steps)));
        let outcome = brain.wake(&Wakeup::new("cat-1", Trigger::InitialSetup), 1).await;
        assert_eq!(outcome.iterations, 5);
        assert_eq!(outcome.calls.len(), 5);
        assert!(outcome.actions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_soft() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        let brain = engine(store.clone(), Arc::new(SlowModel));
        let outcome = brain.wake(&Wakeup::new("cat-1", Trigger::InitialSetup), 1).await;
        assert!(outcome.error.unwrap().contains("timed out"));
        assert_eq!(store.get_agent("cat-1").await.unwrap().unwrap().policy_version, 0);
    }

    #[tokio::test]
    async fn test_partnership_auto_accept_and_reject() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        seed(&store, "rev-1", AgentType::Review, dec!(0.05)).await;
        seed(&store, "cur-1", AgentType::Curation, dec!(0.05)).await;
        let mut proposer = store.get_agent("cat-1").await.unwrap().unwrap();
        proposer.reputation = 4.0;
        store.save_agent(&proposer).await.unwrap();
        let brain = engine(store.clone(), Arc::new(RuleBasedModel::new()));
        let policy = Policy::from_personality(Personality::Balanced);

        let (accepted, notify) = brain
            .propose_partnership(&proposer, &policy, "rev-1", Some(55), 3)
            .await
            .unwrap();
        assert_eq!(accepted["status"], json!("ACTIVE"));
        assert_eq!(notify.agent_id, "rev-1");

        let (rejected, _) = brain
            .propose_partnership(&proposer, &policy, "cur-1", Some(80), 3)
            .await
            .unwrap();
        assert_eq!(rejected["status"], json!("ENDED"));

        // One live partnership per pair.
        assert!(brain.propose_partnership(&proposer, &policy, "rev-1", None, 4).await.is_err());

        brain.end_partnership("rev-1", "cat-1", "not profitable", 5).await.unwrap();
        let all = store.partnerships_for_agent("cat-1").await.unwrap();
        assert!(all.iter().all(|p| p.status == PartnershipStatus::Ended));
    }

    #[tokio::test]
    async fn test_low_reputation_proposal_stays_proposed() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        seed(&store, "rev-1", AgentType::Review, dec!(0.05)).await;
        let proposer = store.get_agent("cat-1").await.unwrap().unwrap();
        let brain = engine(store.clone(), Arc::new(RuleBasedModel::new()));
        let policy = Policy::from_personality(Personality::Balanced);
        let (value, _) = brain
            .propose_partnership(&proposer, &policy, "rev-1", None, 3)
            .await
            .unwrap();
        assert_eq!(value["status"], json!("PROPOSED"));
        let stored = store.partnerships_for_agent("rev-1").await.unwrap();
        assert!(stored[0].consent.a_accepted && !stored[0].consent.b_accepted);
    }

    #[tokio::test]
    async fn test_qbr_records_review_and_reschedules() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "cat-1", AgentType::Catalog, dec!(0.05)).await;
        let mut agent = store.get_agent("cat-1").await.unwrap().unwrap();
        agent.next_qbr_round = 10;
        store.save_agent(&agent).await.unwrap();

        let brain = engine(store.clone(), Arc::new(RuleBasedModel::new()));
        let outcomes = brain
            .wake_many(
                vec![Wakeup::new(
                    "cat-1",
                    Trigger::Qbr {
                        period_start: 1,
                        period_end: 10,
                    },
                )],
                10,
            )
            .await;
        assert_eq!(outcomes.len(), 1);

        let reviews = store.qbr_history("cat-1", 5).await.unwrap();
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].next_review_round, 20);
        assert_eq!(store.get_agent("cat-1").await.unwrap().unwrap().next_qbr_round, 20);
        let memories = store.memories_for_agent("cat-1", 10).await.unwrap();
        assert!(memories.iter().any(|m| m.kind == MemoryKind::QbrInsight));
    }
}
