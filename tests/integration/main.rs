//! Integration tests: full rounds on the in-memory store.

mod mock_registry;
mod scenarios;
mod simulation;

use std::sync::Arc;

use agora::brain::rules::RuleBasedModel;
use agora::config::{AgentSeed, AppConfig};
use agora::engine::arena::ArenaService;
use agora::storage::memory::MemoryStore;
use agora::types::{AgentType, Personality, SkillTier};

pub fn arena(cfg: &AppConfig) -> (Arc<MemoryStore>, ArenaService) {
    let store = Arc::new(MemoryStore::new());
    let service = ArenaService::new(store.clone(), cfg, Arc::new(RuleBasedModel::new()));
    (store, service)
}

pub fn seed(id: &str, agent_type: AgentType, personality: Personality) -> AgentSeed {
    AgentSeed {
        id: id.to_string(),
        name: id.to_uppercase(),
        agent_type,
        personality,
        skill: SkillTier::Standard,
        initial_balance: None,
    }
}

/// Two agents per category, mixed personalities.
pub fn roster() -> Vec<AgentSeed> {
    vec![
        seed("catalog-a", AgentType::Catalog, Personality::Aggressive),
        seed("catalog-b", AgentType::Catalog, Personality::Conservative),
        seed("review-a", AgentType::Review, Personality::Balanced),
        seed("review-b", AgentType::Review, Personality::Opportunistic),
        seed("curation-a", AgentType::Curation, Personality::Balanced),
        seed("seller-a", AgentType::Seller, Personality::Aggressive),
    ]
}
