//! On-chain ground truth — read-through cache of the registry's balances
//! and reputations.
//!
//! The cache is display-only. Rounds settle against the engine's own
//! ledger, and registry values are never written back into agents; the API
//! serves them next to each agent so drift can be compared. The engine
//! never waits on the registry: values are cached with a staleness
//! tolerance and refreshed between rounds, and a failed fetch falls back to
//! whatever the cache last held. The registry stores reputation on a 0–500
//! scale; it is converted to the internal 0–5 scale here and nowhere else.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ChainConfig;
use crate::types::{clamp_reputation, REPUTATION_MAX};

/// Registry reputation units per internal reputation point.
const CONTRACT_SCALE: f64 = 100.0;

/// Registry reputation (0–500) to the internal 0–5 scale.
pub fn reputation_from_contract(raw: u32) -> f64 {
    clamp_reputation(raw as f64 / CONTRACT_SCALE)
}

/// Internal reputation to registry units.
pub fn reputation_to_contract(reputation: f64) -> u32 {
    (clamp_reputation(reputation) * CONTRACT_SCALE).round() as u32
}

/// One agent's state as the registry reports it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainRecord {
    pub agent_id: String,
    pub balance: Decimal,
    /// Internal 0–5 scale.
    pub reputation: f64,
    pub fetched_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GroundTruth: Send + Sync {
    async fn fetch(&self, agent_id: &str) -> Result<ChainRecord>;
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegistryAgent {
    balance: Decimal,
    /// 0–500.
    reputation: u32,
}

/// Registry gateway reached over HTTP (`GET {base}/agents/{id}`).
pub struct HttpGroundTruth {
    http: Client,
    base_url: String,
}

impl HttpGroundTruth {
    pub fn new(cfg: &ChainConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
            .user_agent("agora/0.1.0")
            .build()
            .context("Failed to build registry HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl GroundTruth for HttpGroundTruth {
    async fn fetch(&self, agent_id: &str) -> Result<ChainRecord> {
        let url = format!("{}/agents/{}", self.base_url, urlencoding::encode(agent_id));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Registry request failed for {agent_id}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("Registry returned {} for {agent_id}", resp.status());
        }
        let body: RegistryAgent = resp
            .json()
            .await
            .with_context(|| format!("Malformed registry response for {agent_id}"))?;
        if body.reputation as f64 > REPUTATION_MAX * CONTRACT_SCALE {
            warn!(agent_id, raw = body.reputation, "Registry reputation above scale, clamping");
        }
        Ok(ChainRecord {
            agent_id: agent_id.to_string(),
            balance: body.balance,
            reputation: reputation_from_contract(body.reputation),
            fetched_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct ChainCache {
    source: Arc<dyn GroundTruth>,
    staleness: Duration,
    entries: RwLock<HashMap<String, ChainRecord>>,
}

impl ChainCache {
    pub fn new(source: Arc<dyn GroundTruth>, staleness_secs: i64) -> Self {
        Self {
            source,
            staleness: Duration::seconds(staleness_secs),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Cached value without fetching, however old.
    pub async fn cached(&self, agent_id: &str) -> Option<ChainRecord> {
        self.entries.read().await.get(agent_id).cloned()
    }

    pub async fn get(&self, agent_id: &str) -> Option<ChainRecord> {
        self.get_at(agent_id, Utc::now()).await
    }

    /// Serve a fresh cached value, otherwise fetch; a failed fetch returns
    /// the stale value if there is one.
    pub async fn get_at(&self, agent_id: &str, now: DateTime<Utc>) -> Option<ChainRecord> {
        let cached = self.cached(agent_id).await;
        if let Some(record) = &cached {
            if now - record.fetched_at < self.staleness {
                return cached;
            }
        }
        match self.source.fetch(agent_id).await {
            Ok(record) => {
                self.entries.write().await.insert(agent_id.to_string(), record.clone());
                Some(record)
            }
            Err(e) => {
                warn!(agent_id, error = %e, stale = cached.is_some(), "Registry fetch failed");
                cached
            }
        }
    }

    /// Refetch every listed agent. Returns how many refreshed.
    pub async fn refresh(&self, agent_ids: &[String]) -> usize {
        let mut refreshed = 0;
        for agent_id in agent_ids {
            match self.source.fetch(agent_id).await {
                Ok(record) => {
                    debug!(
                        agent_id = %agent_id,
                        balance = %record.balance,
                        reputation = record.reputation,
                        "Registry value cached"
                    );
                    self.entries.write().await.insert(agent_id.clone(), record);
                    refreshed += 1;
                }
                Err(e) => warn!(agent_id = %agent_id, error = %e, "Registry refresh failed"),
            }
        }
        info!(refreshed, requested = agent_ids.len(), "Registry cache refreshed");
        refreshed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(agent_id: &str, balance: Decimal, fetched_at: DateTime<Utc>) -> ChainRecord {
        ChainRecord {
            agent_id: agent_id.to_string(),
            balance,
            reputation: 3.5,
            fetched_at,
        }
    }

    #[test]
    fn test_reputation_conversion() {
        assert_eq!(reputation_from_contract(350), 3.5);
        assert_eq!(reputation_from_contract(100), 1.0);
        assert_eq!(reputation_from_contract(900), 5.0);
        assert_eq!(reputation_to_contract(4.25), 425);
        assert_eq!(reputation_to_contract(7.0), 500);
    }

    #[tokio::test]
    async fn test_fresh_value_served_from_cache() {
        let now = Utc::now();
        let mut mock = MockGroundTruth::new();
        mock.expect_fetch()
            .times(1)
            .returning(move |id| Ok(record(id, dec!(0.10), now)));
        let cache = ChainCache::new(Arc::new(mock), 120);

        let first = cache.get_at("a1", now).await.unwrap();
        let second = cache.get_at("a1", now + Duration::seconds(60)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stale_value_refetched() {
        let now = Utc::now();
        let mut mock = MockGroundTruth::new();
        let mut calls = 0;
        mock.expect_fetch().times(2).returning(move |id| {
            calls += 1;
            Ok(record(id, Decimal::from(calls), now))
        });
        let cache = ChainCache::new(Arc::new(mock), 120);

        assert_eq!(cache.get_at("a1", now).await.unwrap().balance, dec!(1));
        let later = cache.get_at("a1", now + Duration::seconds(121)).await.unwrap();
        assert_eq!(later.balance, dec!(2));
    }

    #[tokio::test]
    async fn test_failed_fetch_falls_back_to_stale() {
        let now = Utc::now();
        let mut mock = MockGroundTruth::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(move |id| Ok(record(id, dec!(0.07), now)));
        mock.expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("registry down")));
        let cache = ChainCache::new(Arc::new(mock), 10);

        cache.get_at("a1", now).await.unwrap();
        let stale = cache.get_at("a1", now + Duration::seconds(30)).await.unwrap();
        assert_eq!(stale.balance, dec!(0.07));
    }

    #[tokio::test]
    async fn test_missing_value_and_failed_fetch() {
        let mut mock = MockGroundTruth::new();
        mock.expect_fetch().returning(|_| Err(anyhow::anyhow!("timeout")));
        let cache = ChainCache::new(Arc::new(mock), 10);
        assert!(cache.get("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_counts_successes() {
        let now = Utc::now();
        let mut mock = MockGroundTruth::new();
        mock.expect_fetch()
            .withf(|id| id == "bad")
            .returning(|_| Err(anyhow::anyhow!("not registered")));
        mock.expect_fetch().returning(move |id| Ok(record(id, dec!(0.05), now)));
        let cache = ChainCache::new(Arc::new(mock), 10);

        let ids = vec!["a1".to_string(), "bad".to_string(), "a2".to_string()];
        assert_eq!(cache.refresh(&ids).await, 2);
        assert!(cache.cached("a2").await.is_some());
        assert!(cache.cached("bad").await.is_none());
    }
}
