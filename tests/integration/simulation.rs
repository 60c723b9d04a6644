//! Multi-round simulation against the in-memory store.
//!
//! Plays a full roster through many rounds and checks the economy's
//! invariants hold after every round, then exercises re-running rounds.

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

use agora::brain::rules::RuleBasedModel;
use agora::brain::PolicyDecisionEngine;
use agora::config::AppConfig;
use agora::engine::arena::{ResumeOutcome, RunOutcome, RunRequest};
use agora::engine::auction::AuctionService;
use agora::engine::economy::EconomyService;
use agora::engine::exceptions::ExceptionDetector;
use agora::engine::round::{RoundParams, RoundProcessor};
use agora::memory::MemoryService;
use agora::storage::memory::MemoryStore;
use agora::storage::{ArenaStore, SharedStore};
use agora::types::*;

async fn assert_invariants(store: &MemoryStore) {
    for agent in store.list_agents().await.unwrap() {
        assert!(agent.balance >= Decimal::ZERO, "{} went negative: {}", agent.id, agent.balance);
        assert!(agent.peak_balance >= agent.balance);
        assert!((0.0..=5.0).contains(&agent.reputation));

        let history = store.policy_history(&agent.id).await.unwrap();
        let versions: Vec<u32> = history.iter().map(|v| v.version).collect();
        let expected: Vec<u32> = (1..=agent.policy_version).collect();
        assert_eq!(versions, expected, "policy history of {} is not contiguous", agent.id);
    }

    for status in [
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ] {
        for task in store.tasks_with_status(status).await.unwrap() {
            let bids = store.bids_for_task(&task.id).await.unwrap();
            let accepted: Vec<&Bid> = bids
                .iter()
                .filter(|b| b.status == BidStatus::Accepted)
                .collect();
            assert_eq!(accepted.len(), 1, "task {} has {} accepted bids", task.id, accepted.len());
            assert_eq!(task.assigned_agent.as_deref(), Some(accepted[0].agent_id.as_str()));
            let amount = task.winning_amount.unwrap();
            assert!(amount <= task.max_bid, "task {} won above its ceiling", task.id);
            assert!(bids.iter().all(|b| b.status != BidStatus::Pending));
        }
    }

    for task in store.tasks_with_status(TaskStatus::Expired).await.unwrap() {
        let bids = store.bids_for_task(&task.id).await.unwrap();
        assert!(bids.iter().all(|b| b.status != BidStatus::Accepted));
    }
}

async fn balances(store: &MemoryStore) -> HashMap<String, Decimal> {
    store
        .list_agents()
        .await
        .unwrap()
        .into_iter()
        .map(|a| (a.id, a.balance))
        .collect()
}

#[tokio::test]
async fn test_twenty_rounds_keep_invariants() {
    let mut cfg = AppConfig::default();
    cfg.arena.tasks_per_round = 6;
    let (store, arena) = crate::arena(&cfg);
    arena.seed_roster(&crate::roster()).await.unwrap();

    let mut total_completed = 0;
    for _ in 0..20 {
        let RunOutcome::Completed { rounds } =
            arena.run_rounds("sim", &RunRequest::default()).await.unwrap()
        else {
            panic!("lock unexpectedly busy");
        };
        total_completed += rounds[0].result.tasks_completed;
        assert!(rounds[0].result.errors.is_empty(), "{:?}", rounds[0].result.errors);
        assert_invariants(&store).await;
    }

    let state = store.load_state().await.unwrap();
    assert_eq!(state.last_completed_round, 20);
    assert_eq!(state.current_round, 20);
    assert!(state.active_season.is_some());
    assert!(total_completed > 0);

    // Every ledger entry is unique per (round, agent, kind, reference).
    for round in 1..=20 {
        let entries = store.ledger_for_round(round).await.unwrap();
        let mut keys: Vec<(String, String, String)> = entries
            .iter()
            .map(|e| (e.agent_id.clone(), format!("{:?}", e.kind), e.reference.clone()))
            .collect();
        keys.sort();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len(), "duplicate ledger key in round {round}");
    }
}

#[tokio::test]
async fn test_completed_round_replays_as_noop() {
    let (store, arena) = crate::arena(&AppConfig::default());
    arena.seed_roster(&crate::roster()).await.unwrap();
    arena
        .run_rounds(
            "sim",
            &RunRequest {
                rounds: Some(2),
                ..RunRequest::default()
            },
        )
        .await
        .unwrap();

    let shared: SharedStore = store.clone();
    let economy = Arc::new(EconomyService::new(shared.clone(), Default::default()));
    let detector = Arc::new(ExceptionDetector::new(shared.clone(), Default::default()));
    let memory = Arc::new(MemoryService::new(shared.clone()));
    let brain = Arc::new(PolicyDecisionEngine::new(
        shared.clone(),
        economy.clone(),
        detector.clone(),
        memory.clone(),
        Arc::new(RuleBasedModel::new()),
        Default::default(),
        Default::default(),
    ));
    let auction = AuctionService::new(shared.clone(), economy.clone(), Default::default());
    let processor = RoundProcessor::new(shared, economy, auction, detector, brain, memory, 2);

    let ledger_before = store.ledger_for_round(2).await.unwrap().len();
    let before = balances(&store).await;
    let params = RoundParams::from_config(&AppConfig::default().arena);
    let result = processor.process(2, &params).await.unwrap();

    assert!(result.replayed);
    assert_eq!(result.agents.len(), 6);
    assert_eq!(store.ledger_for_round(2).await.unwrap().len(), ledger_before);
    assert_eq!(balances(&store).await, before);
}

#[tokio::test]
async fn test_rerunning_a_rolled_back_round_applies_nothing_twice() {
    let (store, arena) = crate::arena(&AppConfig::default());
    arena.seed_roster(&crate::roster()).await.unwrap();
    arena
        .run_rounds(
            "sim",
            &RunRequest {
                rounds: Some(3),
                ..RunRequest::default()
            },
        )
        .await
        .unwrap();

    let ledger_before = store.ledger_for_round(3).await.unwrap().len();
    let bids_before = store.bids_for_round(3).await.unwrap().len();
    let before = balances(&store).await;

    // Simulate a crash after round 3's effects landed but before it was
    // marked complete.
    let mut state = store.load_state().await.unwrap();
    state.last_completed_round = 2;
    store.save_state(&state).await.unwrap();

    let RunOutcome::Completed { rounds } =
        arena.run_rounds("sim", &RunRequest::default()).await.unwrap()
    else {
        panic!("lock unexpectedly busy");
    };
    assert_eq!(rounds[0].result.round, 3);
    assert!(!rounds[0].result.replayed);
    assert_eq!(rounds[0].result.bids_placed, 0);

    assert_eq!(store.ledger_for_round(3).await.unwrap().len(), ledger_before);
    assert_eq!(store.bids_for_round(3).await.unwrap().len(), bids_before);
    assert_eq!(balances(&store).await, before);
    assert_eq!(store.load_state().await.unwrap().last_completed_round, 3);
    assert_invariants(&store).await;
}

#[tokio::test]
async fn test_paused_roster_sits_out_until_resumed() {
    let (store, arena) = crate::arena(&AppConfig::default());
    arena.seed_roster(&crate::roster()).await.unwrap();
    arena.run_rounds("sim", &RunRequest::default()).await.unwrap();
    arena.reset("sim").await.unwrap();

    let RunOutcome::Completed { rounds } =
        arena.run_rounds("sim", &RunRequest::default()).await.unwrap()
    else {
        panic!("lock unexpectedly busy");
    };
    assert_eq!(rounds[0].result.round, 1);
    assert_eq!(rounds[0].result.bids_placed, 0);

    assert_eq!(arena.resume_agents("sim").await.unwrap(), ResumeOutcome::Resumed { resumed: 6 });
    let RunOutcome::Completed { rounds } =
        arena.run_rounds("sim", &RunRequest::default()).await.unwrap()
    else {
        panic!("lock unexpectedly busy");
    };
    assert!(rounds[0].result.bids_placed > 0);
    assert_invariants(&store).await;
}
