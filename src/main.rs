//! AGORA — round-based auction and policy engine for an agent economy.
//!
//! Entry point. Loads configuration, initialises structured logging, opens
//! the store, seeds the roster, serves the round-trigger API and, when
//! auto-run is on, plays a round every interval until Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use agora::api::{self, ApiState};
use agora::brain::anthropic::AnthropicModel;
use agora::brain::rules::RuleBasedModel;
use agora::brain::DecisionModel;
use agora::chain::{ChainCache, HttpGroundTruth};
use agora::config;
use agora::engine::arena::{ArenaService, RunOutcome, RunRequest};
use agora::storage;

const BANNER: &str = r#"
    _    ____  ___  ____      _
   / \  / ___|/ _ \|  _ \    / \
  / _ \| |  _| | | | |_) |  / _ \
 / ___ \ |_| | |_| |  _ <  / ___ \
/_/   \_\____|\___/|_| \_\/_/   \_\

  Round-based agent task economy
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("AGORA_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::AppConfig::load(&config_path)?;

    init_logging();

    println!("{BANNER}");
    info!(
        config = %config_path,
        store = %cfg.store.database_url,
        provider = %cfg.brain.provider,
        auto_run = cfg.arena.auto_run,
        roster = cfg.agents.len(),
        "AGORA starting up"
    );

    // -- Initialise components -------------------------------------------

    let store = storage::open_store(&cfg.store).await?;

    let mut anthropic: Option<Arc<AnthropicModel>> = None;
    let model: Arc<dyn DecisionModel> = match cfg.brain.provider.as_str() {
        "anthropic" => match cfg.brain_api_key() {
            Some(key) => {
                info!(model = %cfg.brain.model, "Using Anthropic decision model");
                let client = Arc::new(AnthropicModel::new(key, &cfg.brain)?);
                anthropic = Some(client.clone());
                client as Arc<dyn DecisionModel>
            }
            None => {
                warn!(
                    env = %cfg.brain.api_key_env,
                    "No decision-model API key set, falling back to rules"
                );
                Arc::new(RuleBasedModel::new())
            }
        },
        "rules" => Arc::new(RuleBasedModel::new()),
        other => {
            warn!(provider = other, "Unknown decision provider, using rules");
            Arc::new(RuleBasedModel::new())
        }
    };

    let mut arena = ArenaService::new(store.clone(), &cfg, model);
    if cfg.chain.enabled {
        let source = Arc::new(HttpGroundTruth::new(&cfg.chain)?);
        info!(
            url = %cfg.chain.base_url,
            staleness_secs = cfg.chain.staleness_secs,
            "Registry cache enabled"
        );
        arena = arena.with_chain(Arc::new(ChainCache::new(source, cfg.chain.staleness_secs)));
    }
    let arena = Arc::new(arena);

    arena.seed_roster(&cfg.agents).await?;
    let state = store.load_state().await?;
    info!(
        last_completed_round = state.last_completed_round,
        active_season = ?state.active_season,
        "State loaded"
    );

    let api_handle = if cfg.api.enabled {
        let api_state = Arc::new(ApiState {
            arena: arena.clone(),
            holder: format!("{}-api", cfg.arena.holder_id),
        });
        Some(api::spawn_api(api_state, cfg.api.port).await?)
    } else {
        None
    };

    // -- Main loop -------------------------------------------------------

    let holder = cfg.arena.holder_id.clone();
    let period = Duration::from_secs(cfg.arena.round_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    if cfg.arena.auto_run {
        info!(interval_secs = cfg.arena.round_interval_secs, "Auto-run on. Press Ctrl+C to stop.");
    } else {
        info!("Auto-run off; rounds run through the API. Press Ctrl+C to stop.");
    }

    loop {
        tokio::select! {
            _ = interval.tick(), if cfg.arena.auto_run => {
                match arena.run_rounds(&holder, &RunRequest::default()).await {
                    Ok(RunOutcome::Completed { rounds }) => {
                        for report in &rounds {
                            info!(
                                round = report.result.round,
                                season = report.season,
                                completed = report.result.tasks_completed,
                                revenue = format!("${:.4}", report.result.revenue_total),
                                wakeups = report.result.wakeups.len(),
                                "Scheduled round done"
                            );
                        }
                    }
                    Ok(RunOutcome::Busy { holder, expires_at }) => {
                        info!(%holder, ?expires_at, "Round lock busy, skipping tick");
                    }
                    Err(e) => {
                        error!(error = %format!("{e:#}"), "Scheduled round failed, continuing")
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    if let Some(handle) = api_handle {
        handle.abort();
    }
    if let Some(client) = anthropic {
        info!(
            calls = client.total_calls(),
            cost = format!("${:.4}", client.total_cost()),
            "Decision model usage"
        );
    }
    let state = store.load_state().await?;
    info!(last_completed_round = state.last_completed_round, "AGORA shut down cleanly.");
    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agora=info"));

    if std::env::var("AGORA_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
