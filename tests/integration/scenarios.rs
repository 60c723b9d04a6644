//! The reference scenarios, driven through the public services.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use agora::brain::rules::RuleBasedModel;
use agora::brain::{PolicyDecisionEngine, Trigger, Wakeup};
use agora::config::{AppConfig, AuctionConfig, BrainConfig, EconomyConfig, ExceptionsConfig};
use agora::engine::arena::{ArenaService, LockOutcome, RunOutcome, RunRequest};
use agora::engine::auction::AuctionService;
use agora::engine::economy::EconomyService;
use agora::engine::exceptions::ExceptionDetector;
use agora::engine::tasks::TaskService;
use agora::memory::MemoryService;
use agora::policy::{Policy, PolicyVersion, TriggerKind, TriggerMeta};
use agora::storage::memory::MemoryStore;
use agora::storage::{ArenaStore, SharedStore};
use agora::types::*;

fn agent(id: &str, reputation: f64, balance: Decimal) -> Agent {
    let mut a = Agent::new(id, id, AgentType::Catalog, Personality::Balanced);
    a.status = AgentStatus::Active;
    a.reputation = reputation;
    a.balance = balance;
    a.peak_balance = balance;
    a
}

fn bid(task_id: &str, agent_id: &str, amount: Decimal) -> Bid {
    Bid::new(
        task_id,
        agent_id,
        1,
        amount,
        PolicySnapshot {
            source: PolicySource::PersonalityDefault,
            policy_version: 0,
            margin: dec!(0.2),
            cost_basis: dec!(0.004),
            survival_mode: None,
        },
    )
}

async fn auction_fixture(b_balance: Decimal) -> (Arc<MemoryStore>, AuctionService) {
    let store = Arc::new(MemoryStore::new());
    store.insert_agent(&agent("A", 4.0, dec!(0.10))).await.unwrap();
    store.insert_agent(&agent("B", 3.0, b_balance)).await.unwrap();
    let shared: SharedStore = store.clone();
    TaskService::new(shared.clone())
        .create_task("task-1", AgentType::Catalog, dec!(0.02), 1, 2)
        .await
        .unwrap();
    let economy = Arc::new(EconomyService::new(shared.clone(), EconomyConfig::default()));
    let auction = AuctionService::new(shared, economy, AuctionConfig::default());
    auction
        .submit_batch_bids(&[bid("task-1", "A", dec!(0.006)), bid("task-1", "B", dec!(0.008))])
        .await
        .unwrap();
    (store, auction)
}

#[tokio::test]
async fn test_scenario_reputation_and_price_pick_the_winner() {
    let (store, auction) = auction_fixture(dec!(0.10)).await;
    let outcome = auction.resolve_round(1).await.unwrap();
    assert_eq!(outcome.resolutions.len(), 1);
    assert_eq!(outcome.resolutions[0].winner, "A");

    let task = store.get_task("task-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.assigned_agent.as_deref(), Some("A"));
    assert_eq!(task.winning_amount, Some(dec!(0.006)));

    let bids = store.bids_for_task("task-1").await.unwrap();
    let b = bids.iter().find(|b| b.agent_id == "B").unwrap();
    assert_eq!(b.status, BidStatus::Rejected);
    assert_eq!(store.get_agent("B").await.unwrap().unwrap().balance, dec!(0.099));
    assert_eq!(store.get_agent("A").await.unwrap().unwrap().bids_won, 1);
}

#[tokio::test]
async fn test_scenario_losing_bid_never_drives_balance_negative() {
    let (store, auction) = auction_fixture(dec!(0.0009)).await;
    auction.resolve_round(1).await.unwrap();
    let b = store.get_agent("B").await.unwrap().unwrap();
    assert_eq!(b.balance, Decimal::ZERO);
    assert_eq!(b.bids_lost, 1);

    // Settling the round again changes nothing.
    auction.resolve_round(1).await.unwrap();
    assert_eq!(store.get_agent("B").await.unwrap().unwrap().bids_lost, 1);
}

#[tokio::test]
async fn test_scenario_loss_streak_revises_policy() {
    let store = Arc::new(MemoryStore::new());
    let mut a = agent("streaky", 3.0, dec!(0.05));
    a.consecutive_losses = 5;
    a.bids_lost = 5;
    a.policy_version = 3;
    store.insert_agent(&a).await.unwrap();
    for version in 1..=3 {
        store
            .append_policy_version(&PolicyVersion {
                agent_id: a.id.clone(),
                version,
                policy: Policy::from_personality(Personality::Balanced),
                reasoning: format!("seed v{version}"),
                trigger: TriggerMeta {
                    kind: TriggerKind::Registration,
                    reference: None,
                    detail: None,
                },
                round: 0,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let shared: SharedStore = store.clone();
    let economy = Arc::new(EconomyService::new(shared.clone(), EconomyConfig::default()));
    let detector = Arc::new(ExceptionDetector::new(shared.clone(), ExceptionsConfig::default()));
    let brain = PolicyDecisionEngine::new(
        shared.clone(),
        economy,
        detector.clone(),
        Arc::new(MemoryService::new(shared.clone())),
        Arc::new(RuleBasedModel::new()),
        AuctionConfig::default(),
        BrainConfig::default(),
    );

    let snapshot = RoundSnapshot {
        round: 12,
        agent_id: a.id.clone(),
        balance: a.balance,
        reputation: a.reputation,
        status: a.status,
        won: 0,
        lost: 1,
    };
    let policy = Policy::from_personality(Personality::Balanced);
    let mut check = detector.check_agent(&a, Some(&policy), &snapshot).await.unwrap();
    assert_eq!(check.raised.len(), 1);
    let record = check.raised.remove(0);
    assert_eq!(record.exception_type, ExceptionType::ConsecutiveLosses);

    let outcome = brain.wake(&Wakeup::new(&a.id, Trigger::Exception { record }), 12).await;
    assert!(outcome.error.is_none(), "{:?}", outcome.error);
    assert_eq!(outcome.new_policy_version, Some(4));

    let v4 = store.latest_policy(&a.id).await.unwrap().unwrap();
    assert_eq!(v4.version, 4);
    assert_eq!(v4.trigger.kind, TriggerKind::Exception);
    assert!(!v4.reasoning.is_empty());
    assert_eq!(v4.policy.bidding.unwrap().target_margin, dec!(0.16));

    let after = store.get_agent(&a.id).await.unwrap().unwrap();
    assert_eq!(after.policy_version, 4);
    assert_eq!(after.balance, dec!(0.047));
    assert!(store.open_exceptions(Some(&a.id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_scenario_lock_expires_after_ttl() {
    let (_, arena) = crate::arena(&AppConfig::default());
    let t0 = Utc::now();
    assert!(matches!(arena.acquire_lock_at("X", t0).await.unwrap(), LockOutcome::Acquired { .. }));
    assert!(matches!(
        arena.acquire_lock_at("Y", t0 + Duration::seconds(10)).await.unwrap(),
        LockOutcome::Busy { ref holder, .. } if holder == "X"
    ));
    assert!(matches!(
        arena.acquire_lock_at("Y", t0 + Duration::seconds(35)).await.unwrap(),
        LockOutcome::Acquired { .. }
    ));
}

#[tokio::test]
async fn test_scenario_season_of_fifty_rounds_from_101() {
    let mut cfg = AppConfig::default();
    cfg.arena.season_length = 50;
    cfg.arena.tasks_per_round = 4;
    let (store, arena) = crate::arena(&cfg);
    let mut state = store.load_state().await.unwrap();
    state.last_completed_round = 100;
    store.save_state(&state).await.unwrap();
    arena.seed_roster(&crate::roster()).await.unwrap();

    let RunOutcome::Completed { rounds } = arena
        .run_rounds(
            "it",
            &RunRequest {
                rounds: Some(50),
                ..RunRequest::default()
            },
        )
        .await
        .unwrap()
    else {
        panic!("expected completed run");
    };
    assert_eq!(rounds.len(), 50);
    assert_eq!(rounds[0].result.round, 101);
    assert!(rounds[..49].iter().all(|r| r.finalized_season.is_none()));

    let last = &rounds[49];
    assert_eq!(last.result.round, 150);
    let summary = last.finalized_season.as_ref().unwrap();
    assert_eq!(summary.number, 1);
    assert_eq!(summary.leaderboard.len(), 6);
    assert_eq!(summary.leaderboard.iter().filter(|e| e.champion).count(), 1);
    assert_eq!(summary.champion.as_deref(), Some(summary.leaderboard[0].agent_id.as_str()));
    assert!(summary.leaderboard.windows(2).all(|w| w[0].score >= w[1].score));
    assert_eq!(
        summary.leaderboard.iter().map(|e| e.rank).collect::<Vec<_>>(),
        (1..=6).collect::<Vec<u32>>()
    );

    let season = store.season_by_number(1).await.unwrap().unwrap();
    assert_eq!(season.start_round, 101);
    assert!(ArenaService::is_season_boundary(&season, 150));
    assert_eq!(season.status, SeasonStatus::Completed);
    assert!(store.load_state().await.unwrap().active_season.is_none());

    // The next round opens season 2.
    let RunOutcome::Completed { rounds } =
        arena.run_rounds("it", &RunRequest::default()).await.unwrap()
    else {
        panic!("expected completed run");
    };
    assert_eq!(rounds[0].season, 2);
}
