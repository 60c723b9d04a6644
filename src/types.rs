//! Shared types for the AGORA arena.
//!
//! These types form the data model used across all modules.
//! They are kept free of service logic so that the engine, brain,
//! storage and API modules can depend on them without cycles.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound of the canonical internal reputation scale.
pub const REPUTATION_MAX: f64 = 5.0;
/// Lower bound of the canonical internal reputation scale.
pub const REPUTATION_MIN: f64 = 0.0;

/// Clamp a reputation value into `[REPUTATION_MIN, REPUTATION_MAX]`.
pub fn clamp_reputation(value: f64) -> f64 {
    if value.is_nan() {
        return REPUTATION_MIN;
    }
    value.clamp(REPUTATION_MIN, REPUTATION_MAX)
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Task category. An agent only bids on tasks of its own type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    Catalog,
    Review,
    Curation,
    Seller,
}

impl AgentType {
    /// All known categories (useful for iteration).
    pub const ALL: &'static [AgentType] = &[
        AgentType::Catalog,
        AgentType::Review,
        AgentType::Curation,
        AgentType::Seller,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Catalog => "CATALOG",
            AgentType::Review => "REVIEW",
            AgentType::Curation => "CURATION",
            AgentType::Seller => "SELLER",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempt to parse a string into an AgentType (case-insensitive).
impl std::str::FromStr for AgentType {
    type Err = ArenaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "catalog" => Ok(AgentType::Catalog),
            "review" | "reviews" => Ok(AgentType::Review),
            "curation" | "curator" => Ok(AgentType::Curation),
            "seller" | "selling" => Ok(AgentType::Seller),
            _ => Err(ArenaError::Validation(format!("Unknown agent type: {s}"))),
        }
    }
}

/// Personality tag. Supplies bidding defaults when an agent has no stored policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Personality {
    Conservative,
    Balanced,
    Aggressive,
    Opportunistic,
}

impl fmt::Display for Personality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Personality::Conservative => write!(f, "conservative"),
            Personality::Balanced => write!(f, "balanced"),
            Personality::Aggressive => write!(f, "aggressive"),
            Personality::Opportunistic => write!(f, "opportunistic"),
        }
    }
}

/// Skill tier, the second axis of the execution cost table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SkillTier {
    Basic,
    #[default]
    Standard,
    Expert,
}

/// Agent lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Unfunded,
    Active,
    LowFunds,
    Paused,
    Dead,
}

impl AgentStatus {
    /// Whether an agent in this status participates in auctions and pays living costs.
    pub fn is_operating(&self) -> bool {
        matches!(self, AgentStatus::Active | AgentStatus::LowFunds)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Unfunded => write!(f, "UNFUNDED"),
            AgentStatus::Active => write!(f, "ACTIVE"),
            AgentStatus::LowFunds => write!(f, "LOW_FUNDS"),
            AgentStatus::Paused => write!(f, "PAUSED"),
            AgentStatus::Dead => write!(f, "DEAD"),
        }
    }
}

/// Task lifecycle status. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Open,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "OPEN",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Expired => "EXPIRED",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Open, Assigned)
                | (Open, Expired)
                | (Assigned, InProgress)
                | (Assigned, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
        )
    }

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Expired)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bid status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BidStatus::Pending => write!(f, "PENDING"),
            BidStatus::Accepted => write!(f, "ACCEPTED"),
            BidStatus::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Where the margin used for a bid came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Policy,
    PersonalityDefault,
}

impl fmt::Display for PolicySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicySource::Policy => write!(f, "policy"),
            PolicySource::PersonalityDefault => write!(f, "personality_default"),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// An autonomous agent competing in the arena.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub personality: Personality,
    #[serde(default)]
    pub skill: SkillTier,
    /// Latest stored policy version (0 = no stored policy).
    pub policy_version: u32,
    pub balance: Decimal,
    pub peak_balance: Decimal,
    /// Canonical 0–5 scale.
    pub reputation: f64,
    pub status: AgentStatus,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub bids_won: u64,
    pub bids_lost: u64,
    pub consecutive_wins: u32,
    pub consecutive_losses: u32,
    /// Round at which the next periodic review is due.
    pub next_qbr_round: u64,
    /// Rounds in a row without an exception or a balance decline.
    pub stable_rounds: u32,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}/{}] {} | balance=${:.4} | rep={:.2} | W{}/L{} | v{}",
            self.name,
            self.agent_type,
            self.personality,
            self.status,
            self.balance,
            self.reputation,
            self.bids_won,
            self.bids_lost,
            self.policy_version,
        )
    }
}

impl Agent {
    /// Create a new, unfunded agent.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        agent_type: AgentType,
        personality: Personality,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            agent_type,
            personality,
            skill: SkillTier::Standard,
            policy_version: 0,
            balance: Decimal::ZERO,
            peak_balance: Decimal::ZERO,
            reputation: 3.0,
            status: AgentStatus::Unfunded,
            tasks_completed: 0,
            tasks_failed: 0,
            bids_won: 0,
            bids_lost: 0,
            consecutive_wins: 0,
            consecutive_losses: 0,
            next_qbr_round: 0,
            stable_rounds: 0,
            created_at: Utc::now(),
        }
    }

    /// Win rate over resolved bids as a fraction (0.0–1.0).
    pub fn win_rate(&self) -> f64 {
        let resolved = self.bids_won + self.bids_lost;
        if resolved == 0 {
            0.0
        } else {
            self.bids_won as f64 / resolved as f64
        }
    }

    /// Whether the agent takes part in the round (bids and pays living costs).
    pub fn is_operating(&self) -> bool {
        self.status.is_operating()
    }

    pub fn is_dead(&self) -> bool {
        self.status == AgentStatus::Dead
    }

    /// Update peak balance if current is higher.
    pub fn update_peak(&mut self) {
        if self.balance > self.peak_balance {
            self.peak_balance = self.balance;
        }
    }

    /// Apply a signed balance change with a floor of zero.
    /// Returns the amount actually applied (the shortfall is absorbed).
    pub fn apply_balance_delta(&mut self, delta: Decimal) -> Decimal {
        let before = self.balance;
        self.balance = (self.balance + delta).max(Decimal::ZERO);
        self.update_peak();
        self.balance - before
    }

    /// Apply a reputation change, bounded to the internal scale.
    pub fn apply_reputation_delta(&mut self, delta: f64) {
        self.reputation = clamp_reputation(self.reputation + delta);
    }

    /// Record an auction win.
    pub fn record_win(&mut self) {
        self.bids_won += 1;
        self.consecutive_wins += 1;
        self.consecutive_losses = 0;
    }

    /// Record an auction loss.
    pub fn record_loss(&mut self) {
        self.bids_lost += 1;
        self.consecutive_losses += 1;
        self.consecutive_wins = 0;
    }

    /// Runway in rounds at a given per-round burn.
    pub fn runway_rounds(&self, burn_per_round: Decimal) -> Option<u64> {
        if burn_per_round <= Decimal::ZERO {
            return None;
        }
        use rust_decimal::prelude::ToPrimitive;
        (self.balance / burn_per_round).floor().to_u64()
    }
}

// ---------------------------------------------------------------------------
// Task & Bid
// ---------------------------------------------------------------------------

/// A unit of work auctioned to the cheapest credible agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: AgentType,
    pub status: TaskStatus,
    /// Ceiling for any bid on this task.
    pub max_bid: Decimal,
    pub created_round: u64,
    /// Last round in which the task may still be auctioned.
    pub deadline_round: u64,
    pub assigned_agent: Option<String>,
    pub winning_bid: Option<String>,
    pub winning_amount: Option<Decimal>,
    pub completed_round: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} max=${:.4} due=r{}",
            self.task_type, self.id, self.status, self.max_bid, self.deadline_round,
        )
    }
}

impl Task {
    pub fn is_open(&self) -> bool {
        self.status == TaskStatus::Open
    }

    /// Move the task to `next`, enforcing the forward-only lifecycle.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), ArenaError> {
        if !self.status.can_transition_to(next) {
            return Err(ArenaError::InvalidTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Policy context captured at bid time for auditability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicySnapshot {
    pub source: PolicySource,
    pub policy_version: u32,
    /// Margin actually used after any cap at max_bid.
    pub margin: Decimal,
    /// Estimated execution cost the bid was built on.
    pub cost_basis: Decimal,
    #[serde(default)]
    pub survival_mode: Option<crate::policy::SurvivalMode>,
}

/// A sealed offer to perform a task for `amount`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: String,
    pub task_id: String,
    pub agent_id: String,
    pub round: u64,
    pub amount: Decimal,
    pub status: BidStatus,
    /// Submission order assigned by the store; lower wins ties.
    #[serde(default)]
    pub sequence: u64,
    pub submitted_at: DateTime<Utc>,
    pub snapshot: PolicySnapshot,
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ${:.4} {} (margin={:.1}% via {})",
            self.agent_id,
            self.task_id,
            self.amount,
            self.status,
            self.snapshot.margin * Decimal::ONE_HUNDRED,
            self.snapshot.source,
        )
    }
}

impl Bid {
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        round: u64,
        amount: Decimal,
        snapshot: PolicySnapshot,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            round,
            amount,
            status: BidStatus::Pending,
            sequence: 0,
            submitted_at: Utc::now(),
            snapshot,
        }
    }

    /// Expected profit if this bid wins.
    pub fn expected_profit(&self) -> Decimal {
        self.amount - self.snapshot.cost_basis
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Kind of economic effect recorded in the round ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerKind {
    Revenue,
    OperationalCost,
    LivingCost,
    BiddingCost,
    DecisionCost,
    PartnerShare,
    Funding,
    /// Zero-amount marker guarding the win counters of an accepted bid.
    AuctionWin,
    /// Zero-amount marker guarding the penalty of a failed task.
    TaskFailure,
    /// Zero-amount claim marking that a decision wakeup ran for the round.
    DecisionClaim,
    /// Zero-amount marker guarding the round's stability streak update.
    Stability,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::Revenue => "REVENUE",
            LedgerKind::OperationalCost => "OPERATIONAL_COST",
            LedgerKind::LivingCost => "LIVING_COST",
            LedgerKind::BiddingCost => "BIDDING_COST",
            LedgerKind::DecisionCost => "DECISION_COST",
            LedgerKind::PartnerShare => "PARTNER_SHARE",
            LedgerKind::Funding => "FUNDING",
            LedgerKind::AuctionWin => "AUCTION_WIN",
            LedgerKind::TaskFailure => "TASK_FAILURE",
            LedgerKind::DecisionClaim => "DECISION_CLAIM",
            LedgerKind::Stability => "STABILITY",
        }
    }
}

/// One idempotently recorded economic effect.
///
/// Unique on `(round, agent_id, kind, reference)`; recording the same key
/// twice is a no-op, which is what makes a replayed round harmless.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub round: u64,
    pub agent_id: String,
    pub kind: LedgerKind,
    pub reference: String,
    /// Signed amount; negative for debits.
    pub amount: Decimal,
    pub recorded_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        round: u64,
        agent_id: impl Into<String>,
        kind: LedgerKind,
        reference: impl Into<String>,
        amount: Decimal,
    ) -> Self {
        Self {
            round,
            agent_id: agent_id.into(),
            kind,
            reference: reference.into(),
            amount,
            recorded_at: Utc::now(),
        }
    }

    pub fn key(&self) -> (u64, String, LedgerKind, String) {
        (self.round, self.agent_id.clone(), self.kind, self.reference.clone())
    }
}

// ---------------------------------------------------------------------------
// Exceptions & reviews
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExceptionType {
    ConsecutiveLosses,
    BalanceDrop,
    ReputationDrop,
    WinRateDrop,
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionType::ConsecutiveLosses => write!(f, "CONSECUTIVE_LOSSES"),
            ExceptionType::BalanceDrop => write!(f, "BALANCE_DROP"),
            ExceptionType::ReputationDrop => write!(f, "REPUTATION_DROP"),
            ExceptionType::WinRateDrop => write!(f, "WIN_RATE_DROP"),
        }
    }
}

/// A threshold breach detected after a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: String,
    pub agent_id: String,
    pub exception_type: ExceptionType,
    pub metric_value: f64,
    pub threshold: f64,
    pub detected_round: u64,
    pub resolved: bool,
    pub resolved_round: Option<u64>,
    /// Rounds the exception stayed open (set on resolution).
    pub rounds_open: u64,
    pub created_at: DateTime<Utc>,
}

impl ExceptionRecord {
    pub fn new(
        agent_id: impl Into<String>,
        exception_type: ExceptionType,
        metric_value: f64,
        threshold: f64,
        detected_round: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            exception_type,
            metric_value,
            threshold,
            detected_round,
            resolved: false,
            resolved_round: None,
            rounds_open: 0,
            created_at: Utc::now(),
        }
    }

    /// Close the exception at `round`.
    pub fn resolve(&mut self, round: u64) {
        self.resolved = true;
        self.resolved_round = Some(round);
        self.rounds_open = round.saturating_sub(self.detected_round);
    }
}

impl fmt::Display for ExceptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} value={:.3} threshold={:.3} r{}{}",
            self.agent_id,
            self.exception_type,
            self.metric_value,
            self.threshold,
            self.detected_round,
            if self.resolved { " (resolved)" } else { "" },
        )
    }
}

/// Metrics captured as the input of a periodic review.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QbrMetrics {
    pub balance_start: Decimal,
    pub balance_end: Decimal,
    pub reputation_start: f64,
    pub reputation_end: f64,
    pub bids_won: u64,
    pub bids_lost: u64,
    pub win_rate: f64,
    pub exceptions_raised: u64,
}

/// One periodic (quarterly-style) review of an agent's policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QbrRecord {
    pub id: String,
    pub agent_id: String,
    pub period_start: u64,
    pub period_end: u64,
    pub metrics: QbrMetrics,
    /// Action calls taken during the review.
    pub decisions: Vec<String>,
    pub outcome: String,
    pub next_review_round: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Partnerships
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartnershipStatus {
    Proposed,
    Active,
    Ended,
}

/// Consent of both parties, tracked apart from the partnership status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consent {
    pub a_accepted: bool,
    pub b_accepted: bool,
}

/// A two-party revenue-sharing arrangement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partnership {
    pub id: String,
    /// Proposer.
    pub agent_a: String,
    pub agent_b: String,
    /// Proposer's percentage share of joint profit (1–99).
    pub split_a: u8,
    pub status: PartnershipStatus,
    pub consent: Consent,
    pub proposed_round: u64,
    pub ended_round: Option<u64>,
    pub end_reason: Option<String>,
    pub joint_revenue: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Partnership {
    pub fn involves(&self, agent_id: &str) -> bool {
        self.agent_a == agent_id || self.agent_b == agent_id
    }

    /// The other party, if `agent_id` is one of the two.
    pub fn counterpart(&self, agent_id: &str) -> Option<&str> {
        if self.agent_a == agent_id {
            Some(&self.agent_b)
        } else if self.agent_b == agent_id {
            Some(&self.agent_a)
        } else {
            None
        }
    }

    /// Percentage share of joint profit belonging to `agent_id`.
    pub fn share_of(&self, agent_id: &str) -> Option<u8> {
        if self.agent_a == agent_id {
            Some(self.split_a)
        } else if self.agent_b == agent_id {
            Some(100 - self.split_a)
        } else {
            None
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.status, PartnershipStatus::Proposed | PartnershipStatus::Active)
    }
}

// ---------------------------------------------------------------------------
// Seasons & snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeasonStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Season {
    pub id: String,
    pub number: u32,
    pub start_round: u64,
    /// Number of rounds in the season.
    pub length: u64,
    pub end_round: Option<u64>,
    pub status: SeasonStatus,
    pub champion: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Season {
    /// Last round that belongs to this season.
    pub fn planned_end_round(&self) -> u64 {
        self.start_round + self.length.saturating_sub(1)
    }

    /// Rounds completed in this season once `current_round` has finished.
    pub fn rounds_completed(&self, current_round: u64) -> u64 {
        if current_round < self.start_round {
            0
        } else {
            current_round - self.start_round + 1
        }
    }
}

/// Per-round, per-agent state used for leaderboards and trailing metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundSnapshot {
    pub round: u64,
    pub agent_id: String,
    pub balance: Decimal,
    pub reputation: f64,
    pub status: AgentStatus,
    /// Bids won in this round.
    pub won: u32,
    /// Bids lost in this round.
    pub lost: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub season_id: String,
    pub agent_id: String,
    pub rank: u32,
    pub score: f64,
    pub balance_delta: Decimal,
    pub win_rate: f64,
    pub reputation_delta: f64,
    pub champion: bool,
}

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    Idle,
    Running,
}

/// The single global simulation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationState {
    pub current_round: u64,
    pub last_completed_round: u64,
    pub lock_holder: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub status: SimulationStatus,
    pub active_season: Option<String>,
    pub auto_run: bool,
    pub auto_run_interval_secs: u64,
}

impl Default for SimulationState {
    fn default() -> Self {
        Self {
            current_round: 0,
            last_completed_round: 0,
            lock_holder: None,
            lock_expires_at: None,
            status: SimulationStatus::Idle,
            active_season: None,
            auto_run: false,
            auto_run_interval_secs: 60,
        }
    }
}

impl SimulationState {
    /// Whether the lock is free for `holder` at `now`.
    pub fn lock_available(&self, holder: &str, now: DateTime<Utc>) -> bool {
        match (&self.lock_holder, self.lock_expires_at) {
            (None, _) => true,
            (Some(current), _) if current == holder => true,
            (Some(_), Some(expires)) => expires <= now,
            (Some(_), None) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Learning,
    QbrInsight,
    Observation,
    Transparency,
    Market,
}

impl MemoryKind {
    /// Kinds that make up the "important learnings" subset.
    pub fn is_important(&self) -> bool {
        matches!(self, MemoryKind::Learning | MemoryKind::QbrInsight)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    /// `None` for market-wide memories.
    pub agent_id: Option<String>,
    pub kind: MemoryKind,
    pub content: String,
    pub round: u64,
    pub importance: f64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for AGORA.
#[derive(Debug, thiserror::Error)]
pub enum ArenaError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Bid ${amount} exceeds max bid ${max_bid} for task {task_id}")]
    BidExceedsMax {
        task_id: String,
        amount: Decimal,
        max_bid: Decimal,
    },

    #[error("Task {task_id} is not open (status {status})")]
    TaskNotOpen { task_id: String, status: TaskStatus },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Policy version conflict for {agent_id}: expected v{expected}, got v{found}")]
    PolicyVersionConflict {
        agent_id: String,
        expected: u32,
        found: u32,
    },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Partnership error: {0}")]
    Partnership(String),

    #[error("Decision engine error ({model}): {message}")]
    Decision { model: String, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Round lock held by {holder} was taken by {current}")]
    LockLost { holder: String, current: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
