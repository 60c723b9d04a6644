//! Mock registry for integration testing.
//!
//! A deterministic `GroundTruth` that serves balances and reputations set
//! from test code, counts fetches, and can be forced to fail.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use agora::chain::{reputation_from_contract, ChainCache, ChainRecord, GroundTruth};
use agora::config::AppConfig;
use agora::engine::arena::{RunOutcome, RunRequest};
use agora::storage::ArenaStore;

#[derive(Default)]
pub struct MockRegistry {
    /// agent id -> (balance, contract-scale reputation)
    records: Mutex<HashMap<String, (Decimal, u32)>>,
    force_error: Mutex<Option<String>>,
    fetches: Mutex<u32>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, agent_id: &str, balance: Decimal, raw_reputation: u32) {
        self.records
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), (balance, raw_reputation));
    }

    /// Force all subsequent fetches to fail.
    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn fetch_count(&self) -> u32 {
        *self.fetches.lock().unwrap()
    }
}

#[async_trait]
impl GroundTruth for MockRegistry {
    async fn fetch(&self, agent_id: &str) -> Result<ChainRecord> {
        *self.fetches.lock().unwrap() += 1;
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(anyhow!(msg));
        }
        let (balance, raw) = self
            .records
            .lock()
            .unwrap()
            .get(agent_id)
            .copied()
            .ok_or_else(|| anyhow!("{agent_id} not registered on chain"))?;
        Ok(ChainRecord {
            agent_id: agent_id.to_string(),
            balance,
            reputation: reputation_from_contract(raw),
            fetched_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_registry_refreshed_after_each_round() {
    let registry = Arc::new(MockRegistry::new());
    registry.set("catalog-a", dec!(0.10), 420);
    registry.set("catalog-b", dec!(0.08), 310);

    let (store, arena) = crate::arena(&AppConfig::default());
    let cache = Arc::new(ChainCache::new(registry.clone(), 120));
    let arena = arena.with_chain(cache.clone());
    arena.seed_roster(&crate::roster()[..2]).await.unwrap();

    let outcome = arena.run_rounds("it", &RunRequest::default()).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(registry.fetch_count(), 2);

    let cached = cache.cached("catalog-a").await.unwrap();
    assert_eq!(cached.balance, dec!(0.10));
    assert_eq!(cached.reputation, 4.2);

    // Registry values are served alongside agents, never written into them.
    let agent = store.get_agent("catalog-a").await.unwrap().unwrap();
    assert_ne!(agent.reputation, 4.2);
}

#[tokio::test]
async fn test_registry_outage_does_not_stop_rounds() {
    let registry = Arc::new(MockRegistry::new());
    registry.set("catalog-a", dec!(0.10), 300);
    let (store, arena) = crate::arena(&AppConfig::default());
    let cache = Arc::new(ChainCache::new(registry.clone(), 0));
    let arena = arena.with_chain(cache.clone());
    arena.seed_roster(&crate::roster()[..1]).await.unwrap();

    arena.run_rounds("it", &RunRequest::default()).await.unwrap();
    registry.set_error("gateway timeout");
    let outcome = arena
        .run_rounds(
            "it",
            &RunRequest {
                rounds: Some(2),
                ..RunRequest::default()
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { ref rounds } if rounds.len() == 2));
    assert_eq!(store.load_state().await.unwrap().last_completed_round, 3);

    // The last good value is still served while the registry is down.
    let stale = cache.get("catalog-a").await.unwrap();
    assert_eq!(stale.reputation, 3.0);

    registry.clear_error();
    registry.set("catalog-a", dec!(0.20), 300);
    assert_eq!(cache.get("catalog-a").await.unwrap().balance, dec!(0.20));
}
