//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`. Every section has a default so
//! a partial file (or none at all, in tests) still yields a usable config.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;

use crate::types::{AgentType, Personality, SkillTier};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub arena: ArenaConfig,
    pub economy: EconomyConfig,
    pub auction: AuctionConfig,
    pub brain: BrainConfig,
    pub exceptions: ExceptionsConfig,
    pub store: StoreConfig,
    pub chain: ChainConfig,
    pub api: ApiConfig,
    /// Initial roster, registered on first start.
    pub agents: Vec<AgentSeed>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ArenaConfig {
    /// Identity written into the round lock.
    pub holder_id: String,
    pub lock_ttl_secs: i64,
    pub season_length: u64,
    pub auto_run: bool,
    pub round_interval_secs: u64,
    pub tasks_per_round: usize,
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// Rounds a task stays biddable after creation.
    pub task_deadline_rounds: u64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            holder_id: "agora-scheduler".to_string(),
            lock_ttl_secs: 30,
            season_length: 50,
            auto_run: false,
            round_interval_secs: 60,
            tasks_per_round: 8,
            min_price: dec!(0.005),
            max_price: dec!(0.02),
            task_deadline_rounds: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EconomyConfig {
    pub initial_balance: Decimal,
    /// Debited from every operating agent each round.
    pub living_cost: Decimal,
    /// Debited from every rejected bidder.
    pub bidding_cost: Decimal,
    /// Debited on every applied policy update.
    pub decision_cost: Decimal,
    pub low_balance_threshold: Decimal,
    pub reputation_win_delta: f64,
    pub reputation_loss_delta: f64,
    pub reputation_fail_delta: f64,
}

impl Default for EconomyConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(0.10),
            living_cost: dec!(0.0005),
            bidding_cost: dec!(0.001),
            decision_cost: dec!(0.003),
            low_balance_threshold: dec!(0.01),
            reputation_win_delta: 0.05,
            reputation_loss_delta: 0.02,
            reputation_fail_delta: 0.10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuctionConfig {
    /// Baseline that keeps price dominant in the score.
    pub base_score: f64,
    pub reputation_cap: f64,
    pub reputation_multiplier: f64,
}

impl Default for AuctionConfig {
    fn default() -> Self {
        Self {
            base_score: 100.0,
            reputation_cap: 5.0,
            reputation_multiplier: 10.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrainConfig {
    /// "rules" (offline, deterministic) or "anthropic".
    pub provider: String,
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub max_iterations: usize,
    /// Hard budget for a single decision step.
    pub step_timeout_secs: u64,
    /// Independent agent invocations allowed in flight.
    pub max_concurrent: usize,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            provider: "rules".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tokens: 1024,
            max_iterations: 5,
            step_timeout_secs: 60,
            max_concurrent: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExceptionsConfig {
    /// Open exceptions older than this are closed automatically.
    pub auto_resolve_rounds: u64,
}

impl Default for ExceptionsConfig {
    fn default() -> Self {
        Self { auto_resolve_rounds: 10 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory` or a sqlx SQLite URL such as `sqlite://agora.db`.
    pub database_url: String,
    pub max_connections: u32,
    pub query_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "memory".to_string(),
            max_connections: 5,
            query_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChainConfig {
    pub enabled: bool,
    pub base_url: String,
    /// Cached values younger than this are served without a fetch.
    pub staleness_secs: i64,
    pub request_timeout_secs: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "http://localhost:8545".to_string(),
            staleness_secs: 120,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

/// One roster entry.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentSeed {
    pub id: String,
    pub name: String,
    pub agent_type: AgentType,
    pub personality: Personality,
    #[serde(default)]
    pub skill: SkillTier,
    /// Overrides `economy.initial_balance`.
    #[serde(default)]
    pub initial_balance: Option<Decimal>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse configuration from TOML text.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.check()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn check(&self) -> Result<()> {
        if self.arena.lock_ttl_secs <= 0 {
            anyhow::bail!("arena.lock_ttl_secs must be positive");
        }
        if self.arena.season_length == 0 {
            anyhow::bail!("arena.season_length must be at least 1");
        }
        if self.arena.min_price <= Decimal::ZERO || self.arena.min_price > self.arena.max_price {
            anyhow::bail!("arena price bounds are inconsistent");
        }
        if self.brain.max_iterations == 0 {
            anyhow::bail!("brain.max_iterations must be at least 1");
        }
        if self.auction.base_score <= 0.0 {
            anyhow::bail!("auction.base_score must be positive");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// The decision-model API key, if one is configured.
    pub fn brain_api_key(&self) -> Option<SecretString> {
        Self::resolve_env(&self.brain.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .map(SecretString::new)
    }
}
