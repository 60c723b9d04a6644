//! Agent policy documents.
//!
//! A policy is a versioned, schema-validated configuration with explicit
//! optional sections. Every write goes through [`Policy::validate`]; the
//! `bidding` section is mandatory, the rest fall back to defaults.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ArenaError, Personality};

/// Upper bound accepted for any margin (500%).
const MAX_MARGIN: Decimal = dec!(5);

// ---------------------------------------------------------------------------
// Survival mode
// ---------------------------------------------------------------------------

/// Financial-stress flag that widens or narrows bidding margins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivalMode {
    Growth,
    Survival,
    Desperate,
    Conservative,
}

impl SurvivalMode {
    /// Multiplier applied to the target margin.
    pub fn margin_multiplier(&self) -> Decimal {
        match self {
            SurvivalMode::Growth => dec!(1.10),
            SurvivalMode::Conservative => dec!(1.25),
            SurvivalMode::Survival => dec!(0.75),
            SurvivalMode::Desperate => dec!(0.50),
        }
    }
}

impl fmt::Display for SurvivalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurvivalMode::Growth => write!(f, "growth"),
            SurvivalMode::Survival => write!(f, "survival"),
            SurvivalMode::Desperate => write!(f, "desperate"),
            SurvivalMode::Conservative => write!(f, "conservative"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiddingPolicy {
    /// Desired margin over estimated cost (0.20 = 20%).
    pub target_margin: Decimal,
    /// Never bid below this margin.
    pub min_margin: Decimal,
    /// Skip tasks whose absolute profit is below this.
    pub skip_below: Decimal,
    /// Stop bidding when balance drops below this reserve.
    pub reserve_floor: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnershipPolicy {
    /// Accept proposals from agents at or above this reputation...
    #[serde(default)]
    pub auto_accept_min_reputation: Option<f64>,
    /// ...offering us at least this percentage.
    #[serde(default)]
    pub auto_accept_min_split: Option<u8>,
    /// Reject outright when offered less than this percentage.
    #[serde(default)]
    pub auto_reject_below_split: Option<u8>,
    /// Proposer share used when a proposal omits one.
    pub default_split: u8,
}

impl Default for PartnershipPolicy {
    fn default() -> Self {
        Self {
            auto_accept_min_reputation: Some(3.5),
            auto_accept_min_split: Some(40),
            auto_reject_below_split: Some(25),
            default_split: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    /// Tasks estimated above this cost fail when executed.
    #[serde(default)]
    pub cost_ceiling: Option<Decimal>,
    /// Minimum acceptable quality score (0–1).
    pub quality_threshold: f64,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            cost_ceiling: None,
            quality_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionPolicy {
    pub consecutive_losses: u32,
    /// Breach when balance < fraction × peak balance.
    pub balance_floor_fraction: f64,
    /// Reputation points lost over the window.
    pub reputation_drop: f64,
    /// Percent drop of win rate, previous window vs current window.
    pub win_rate_drop_pct: f64,
    pub window_rounds: u64,
}

impl Default for ExceptionPolicy {
    fn default() -> Self {
        Self {
            consecutive_losses: 5,
            balance_floor_fraction: 0.5,
            reputation_drop: 0.5,
            win_rate_drop_pct: 30.0,
            window_rounds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QbrPolicy {
    pub base_frequency_rounds: u64,
    /// Halve the interval when the loss streak reaches this.
    pub accelerate_loss_streak: u32,
    /// Double the interval after this many stable rounds.
    pub decelerate_stable_rounds: u32,
    pub min_frequency: u64,
    pub max_frequency: u64,
}

impl Default for QbrPolicy {
    fn default() -> Self {
        Self {
            base_frequency_rounds: 10,
            accelerate_loss_streak: 3,
            decelerate_stable_rounds: 15,
            min_frequency: 3,
            max_frequency: 30,
        }
    }
}

impl QbrPolicy {
    /// Rounds until the next review given the agent's recent behaviour.
    pub fn next_interval(&self, consecutive_losses: u32, stable_rounds: u32) -> u64 {
        let base = self.base_frequency_rounds;
        let interval = if consecutive_losses >= self.accelerate_loss_streak {
            base / 2
        } else if stable_rounds >= self.decelerate_stable_rounds {
            base.saturating_mul(2)
        } else {
            base
        };
        interval.clamp(self.min_frequency, self.max_frequency)
    }
}

// ---------------------------------------------------------------------------
// Policy document
// ---------------------------------------------------------------------------

/// The full policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub bidding: Option<BiddingPolicy>,
    #[serde(default)]
    pub partnerships: Option<PartnershipPolicy>,
    #[serde(default)]
    pub execution: Option<ExecutionPolicy>,
    #[serde(default)]
    pub exceptions: Option<ExceptionPolicy>,
    #[serde(default)]
    pub qbr: Option<QbrPolicy>,
    #[serde(default)]
    pub survival_mode: Option<SurvivalMode>,
}

impl Policy {
    /// Bidding defaults for a personality (used when no policy is stored).
    pub fn personality_bidding(personality: Personality) -> BiddingPolicy {
        match personality {
            Personality::Conservative => BiddingPolicy {
                target_margin: dec!(0.30),
                min_margin: dec!(0.15),
                skip_below: dec!(0.0005),
                reserve_floor: dec!(0.02),
            },
            Personality::Balanced => BiddingPolicy {
                target_margin: dec!(0.20),
                min_margin: dec!(0.10),
                skip_below: dec!(0.0003),
                reserve_floor: dec!(0.01),
            },
            Personality::Aggressive => BiddingPolicy {
                target_margin: dec!(0.10),
                min_margin: dec!(0.03),
                skip_below: dec!(0.0001),
                reserve_floor: dec!(0.005),
            },
            Personality::Opportunistic => BiddingPolicy {
                target_margin: dec!(0.25),
                min_margin: dec!(0.05),
                skip_below: dec!(0.0002),
                reserve_floor: dec!(0.01),
            },
        }
    }

    /// A complete starting policy derived from a personality.
    pub fn from_personality(personality: Personality) -> Self {
        let exceptions = match personality {
            Personality::Conservative => ExceptionPolicy {
                consecutive_losses: 4,
                ..ExceptionPolicy::default()
            },
            Personality::Aggressive => ExceptionPolicy {
                consecutive_losses: 7,
                balance_floor_fraction: 0.35,
                ..ExceptionPolicy::default()
            },
            _ => ExceptionPolicy::default(),
        };
        Self {
            bidding: Some(Self::personality_bidding(personality)),
            partnerships: Some(PartnershipPolicy::default()),
            execution: Some(ExecutionPolicy::default()),
            exceptions: Some(exceptions),
            qbr: Some(QbrPolicy::default()),
            survival_mode: None,
        }
    }

    /// Parse and validate a JSON policy document.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ArenaError> {
        let policy: Policy = serde_json::from_value(value.clone())
            .map_err(|e| ArenaError::InvalidPolicy(format!("malformed policy document: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Exception thresholds, falling back to defaults.
    pub fn exception_thresholds(&self) -> ExceptionPolicy {
        self.exceptions.clone().unwrap_or_default()
    }

    /// Review schedule, falling back to defaults.
    pub fn qbr_schedule(&self) -> QbrPolicy {
        self.qbr.clone().unwrap_or_default()
    }

    pub fn partnership_rules(&self) -> PartnershipPolicy {
        self.partnerships.clone().unwrap_or_default()
    }

    /// Check every section. Nothing is written unless this passes.
    pub fn validate(&self) -> Result<(), ArenaError> {
        let bidding = self
            .bidding
            .as_ref()
            .ok_or_else(|| ArenaError::InvalidPolicy("missing required section: bidding".into()))?;

        if bidding.min_margin < Decimal::ZERO || bidding.target_margin < Decimal::ZERO {
            return Err(ArenaError::InvalidPolicy("margins must be non-negative".into()));
        }
        if bidding.target_margin > MAX_MARGIN || bidding.min_margin > MAX_MARGIN {
            return Err(ArenaError::InvalidPolicy(format!("margins must not exceed {MAX_MARGIN}")));
        }
        if bidding.target_margin < bidding.min_margin {
            return Err(ArenaError::InvalidPolicy(format!(
                "target margin {} is below min margin {}",
                bidding.target_margin, bidding.min_margin
            )));
        }
        if bidding.skip_below < Decimal::ZERO || bidding.reserve_floor < Decimal::ZERO {
            return Err(ArenaError::InvalidPolicy(
                "skip_below and reserve_floor must be non-negative".into(),
            ));
        }

        if let Some(p) = &self.partnerships {
            let splits = [
                Some(p.default_split),
                p.auto_accept_min_split,
                p.auto_reject_below_split,
            ];
            if splits.iter().flatten().any(|s| *s == 0 || *s >= 100) {
                return Err(ArenaError::InvalidPolicy(
                    "partnership splits must be within 1–99".into(),
                ));
            }
            if let Some(rep) = p.auto_accept_min_reputation {
                if !(0.0..=crate::types::REPUTATION_MAX).contains(&rep) {
                    return Err(ArenaError::InvalidPolicy(
                        "auto_accept_min_reputation must be within the reputation scale".into(),
                    ));
                }
            }
        }

        if let Some(e) = &self.execution {
            if !(0.0..=1.0).contains(&e.quality_threshold) {
                return Err(ArenaError::InvalidPolicy(
                    "quality_threshold must be within 0–1".into(),
                ));
            }
            if matches!(e.cost_ceiling, Some(c) if c <= Decimal::ZERO) {
                return Err(ArenaError::InvalidPolicy("cost_ceiling must be positive".into()));
            }
        }

        if let Some(x) = &self.exceptions {
            if x.consecutive_losses == 0 || x.window_rounds == 0 {
                return Err(ArenaError::InvalidPolicy(
                    "consecutive_losses and window_rounds must be at least 1".into(),
                ));
            }
            if !(x.balance_floor_fraction > 0.0 && x.balance_floor_fraction <= 1.0) {
                return Err(ArenaError::InvalidPolicy(
                    "balance_floor_fraction must be within (0, 1]".into(),
                ));
            }
            if x.reputation_drop <= 0.0 || x.win_rate_drop_pct <= 0.0 {
                return Err(ArenaError::InvalidPolicy("drop thresholds must be positive".into()));
            }
        }

        if let Some(q) = &self.qbr {
            if q.min_frequency == 0 || q.min_frequency > q.max_frequency {
                return Err(ArenaError::InvalidPolicy(
                    "qbr frequency bounds are inconsistent".into(),
                ));
            }
            if !(q.min_frequency..=q.max_frequency).contains(&q.base_frequency_rounds) {
                return Err(ArenaError::InvalidPolicy(
                    "qbr base frequency must lie within its bounds".into(),
                ));
            }
        }

        Ok(())
    }

    /// Produce a new, validated policy with `patch` applied.
    pub fn apply_patch(&self, patch: &PolicyPatch) -> Result<Policy, ArenaError> {
        if patch.is_empty() {
            return Err(ArenaError::InvalidPolicy("policy patch changes nothing".into()));
        }
        let mut next = self.clone();

        let mut bidding = next
            .bidding
            .clone()
            .ok_or_else(|| ArenaError::InvalidPolicy("missing required section: bidding".into()))?;
        if let Some(v) = patch.target_margin {
            bidding.target_margin = v;
        }
        if let Some(v) = patch.min_margin {
            bidding.min_margin = v;
        }
        if let Some(v) = patch.skip_below {
            bidding.skip_below = v;
        }
        if let Some(v) = patch.reserve_floor {
            bidding.reserve_floor = v;
        }
        next.bidding = Some(bidding);

        if patch.clear_survival_mode {
            next.survival_mode = None;
        }
        if let Some(mode) = patch.survival_mode {
            next.survival_mode = Some(mode);
        }

        if patch.cost_ceiling.is_some() {
            let mut exec = next.execution.clone().unwrap_or_default();
            exec.cost_ceiling = patch.cost_ceiling;
            next.execution = Some(exec);
        }

        if patch.consecutive_loss_threshold.is_some() || patch.balance_floor_fraction.is_some() {
            let mut exc = next.exception_thresholds();
            if let Some(v) = patch.consecutive_loss_threshold {
                exc.consecutive_losses = v;
            }
            if let Some(v) = patch.balance_floor_fraction {
                exc.balance_floor_fraction = v;
            }
            next.exceptions = Some(exc);
        }

        if let Some(freq) = patch.qbr_frequency_rounds {
            let mut qbr = next.qbr_schedule();
            qbr.base_frequency_rounds = freq;
            next.qbr = Some(qbr);
        }

        if let Some(split) = patch.default_partnership_split {
            let mut p = next.partnership_rules();
            p.default_split = split;
            next.partnerships = Some(p);
        }

        next.validate()?;
        Ok(next)
    }
}

/// A partial change to a policy, as requested by the decision engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyPatch {
    #[serde(default)]
    pub target_margin: Option<Decimal>,
    #[serde(default)]
    pub min_margin: Option<Decimal>,
    #[serde(default)]
    pub skip_below: Option<Decimal>,
    #[serde(default)]
    pub reserve_floor: Option<Decimal>,
    #[serde(default)]
    pub survival_mode: Option<SurvivalMode>,
    #[serde(default)]
    pub clear_survival_mode: bool,
    #[serde(default)]
    pub cost_ceiling: Option<Decimal>,
    #[serde(default)]
    pub consecutive_loss_threshold: Option<u32>,
    #[serde(default)]
    pub balance_floor_fraction: Option<f64>,
    #[serde(default)]
    pub qbr_frequency_rounds: Option<u64>,
    #[serde(default)]
    pub default_partnership_split: Option<u8>,
}

impl PolicyPatch {
    pub fn is_empty(&self) -> bool {
        self == &PolicyPatch::default()
    }
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// What caused a policy change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Exception,
    Qbr,
    PartnershipEvent,
    InitialSetup,
    Registration,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Exception => write!(f, "exception"),
            TriggerKind::Qbr => write!(f, "qbr"),
            TriggerKind::PartnershipEvent => write!(f, "partnership_event"),
            TriggerKind::InitialSetup => write!(f, "initial_setup"),
            TriggerKind::Registration => write!(f, "registration"),
        }
    }
}

/// Trigger metadata stored with each version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerMeta {
    pub kind: TriggerKind,
    /// Exception id, partnership id, etc.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// One append-only row of an agent's policy history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVersion {
    pub agent_id: String,
    pub version: u32,
    pub policy: Policy,
    /// Full reasoning, stored verbatim.
    pub reasoning: String,
    pub trigger: TriggerMeta,
    pub round: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
