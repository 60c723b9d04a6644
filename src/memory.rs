//! Memory — per-agent and market-wide learnings.
//!
//! Memories are read-only context for the decision engine. Writing one has
//! no effect beyond the write itself.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::storage::SharedStore;
use crate::types::{Memory, MemoryKind};

const RECENT_LIMIT: usize = 10;
const LEARNINGS_LIMIT: usize = 5;
const MARKET_LIMIT: usize = 5;

/// Context assembled for one decision.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryContext {
    pub recent: Vec<Memory>,
    pub learnings: Vec<Memory>,
    pub market: Vec<Memory>,
}

impl MemoryContext {
    /// Plain-text rendering for model prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.learnings.is_empty() {
            out.push_str("KEY LEARNINGS:\n");
            for m in &self.learnings {
                out.push_str(&format!("- [r{}] {}\n", m.round, m.content));
            }
        }
        if !self.recent.is_empty() {
            out.push_str("RECENT MEMORIES:\n");
            for m in &self.recent {
                out.push_str(&format!("- [r{} {:?}] {}\n", m.round, m.kind, m.content));
            }
        }
        if !self.market.is_empty() {
            out.push_str("MARKET FEED:\n");
            for m in &self.market {
                out.push_str(&format!("- [r{}] {}\n", m.round, m.content));
            }
        }
        if out.is_empty() {
            out.push_str("No memories yet.\n");
        }
        out
    }
}

pub struct MemoryService {
    store: SharedStore,
}

impl MemoryService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        agent_id: &str,
        kind: MemoryKind,
        content: impl Into<String>,
        round: u64,
        importance: f64,
    ) -> Result<Memory> {
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: Some(agent_id.to_string()),
            kind,
            content: content.into(),
            round,
            importance: importance.clamp(0.0, 1.0),
            created_at: Utc::now(),
        };
        self.store.insert_memory(&memory).await?;
        debug!(agent_id, kind = ?kind, round, "Memory recorded");
        Ok(memory)
    }

    /// Record a market-wide memory.
    pub async fn record_market(&self, content: impl Into<String>, round: u64) -> Result<Memory> {
        let memory = Memory {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: None,
            kind: MemoryKind::Market,
            content: content.into(),
            round,
            importance: 0.5,
            created_at: Utc::now(),
        };
        self.store.insert_memory(&memory).await?;
        Ok(memory)
    }

    /// Newest first.
    pub async fn recent(&self, agent_id: &str, limit: usize) -> Result<Vec<Memory>> {
        self.store.memories_for_agent(agent_id, limit).await
    }

    /// Newest learning and review-insight memories.
    pub async fn important_learnings(&self, agent_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let scan = self.store.memories_for_agent(agent_id, limit.saturating_mul(10).max(50)).await?;
        Ok(scan.into_iter().filter(|m| m.kind.is_important()).take(limit).collect())
    }

    /// Market-wide feed, newest first.
    pub async fn market_feed(&self, limit: usize) -> Result<Vec<Memory>> {
        self.store.market_memories(limit).await
    }

    pub async fn context(&self, agent_id: &str) -> Result<MemoryContext> {
        Ok(MemoryContext {
            recent: self.recent(agent_id, RECENT_LIMIT).await?,
            learnings: self.important_learnings(agent_id, LEARNINGS_LIMIT).await?,
            market: self.market_feed(MARKET_LIMIT).await?,
        })
    }
}
