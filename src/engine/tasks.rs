//! Task lifecycle — create, assign, start, complete, fail, expire.
//!
//! Every status change goes through [`Task::transition`], so the lifecycle
//! only ever moves forward. Round tasks get deterministic ids, which makes
//! re-generating a round's tasks after an interrupted run harmless.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::storage::SharedStore;
use crate::types::{AgentType, ArenaError, Task, TaskStatus};

/// Parameters for one round's task batch.
#[derive(Debug, Clone)]
pub struct TaskBatch {
    pub count: usize,
    pub min_price: Decimal,
    pub max_price: Decimal,
    /// Rounds the task stays biddable after creation.
    pub deadline_rounds: u64,
    /// Categories to draw from; empty means all of them.
    pub types: Vec<AgentType>,
}

fn open_task(
    id: String,
    task_type: AgentType,
    max_bid: Decimal,
    round: u64,
    deadline_round: u64,
) -> Task {
    Task {
        id,
        task_type,
        status: TaskStatus::Open,
        max_bid,
        created_round: round,
        deadline_round,
        assigned_agent: None,
        winning_bid: None,
        winning_amount: None,
        completed_round: None,
        created_at: Utc::now(),
    }
}

/// An unsaved OPEN task used for what-if bid previews.
pub fn sample_task(task_type: AgentType, max_bid: Decimal) -> Task {
    open_task("sample".to_string(), task_type, max_bid, 0, 0)
}

pub struct TaskService {
    store: SharedStore,
}

impl TaskService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Create and persist a single OPEN task.
    pub async fn create_task(
        &self,
        id: impl Into<String>,
        task_type: AgentType,
        max_bid: Decimal,
        round: u64,
        deadline_rounds: u64,
    ) -> Result<Task> {
        if max_bid <= Decimal::ZERO {
            return Err(
                ArenaError::Validation(format!("max_bid must be positive, got {max_bid}")).into(),
            );
        }
        let task = open_task(id.into(), task_type, max_bid, round, round + deadline_rounds);
        self.store.insert_task(&task).await?;
        debug!(task = %task, "Task created");
        Ok(task)
    }

    /// Generate the round's tasks, spreading prices evenly across the bounds
    /// and rotating categories. Tasks that already exist are reused.
    pub async fn generate_round_tasks(&self, round: u64, batch: &TaskBatch) -> Result<Vec<Task>> {
        if batch.min_price <= Decimal::ZERO || batch.min_price > batch.max_price {
            return Err(ArenaError::Validation(format!(
                "invalid price bounds {}..{}",
                batch.min_price, batch.max_price
            ))
            .into());
        }
        let types: &[AgentType] = if batch.types.is_empty() {
            AgentType::ALL
        } else {
            &batch.types
        };
        let step = if batch.count > 1 {
            (batch.max_price - batch.min_price) / Decimal::from(batch.count as u64 - 1)
        } else {
            Decimal::ZERO
        };

        let mut tasks = Vec::with_capacity(batch.count);
        for i in 0..batch.count {
            let id = format!("task-{round}-{i:03}");
            if let Some(existing) = self.store.get_task(&id).await? {
                tasks.push(existing);
                continue;
            }
            let task_type = types[(round as usize + i) % types.len()];
            let price = (batch.min_price + step * Decimal::from(i as u64)).round_dp(6);
            tasks.push(self.create_task(id, task_type, price, round, batch.deadline_rounds).await?);
        }

        info!(round, count = tasks.len(), "Round tasks ready");
        Ok(tasks)
    }

    pub async fn open_tasks(&self) -> Result<Vec<Task>> {
        self.store.tasks_with_status(TaskStatus::Open).await
    }

    async fn load(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| ArenaError::TaskNotFound(task_id.to_string()).into())
    }

    /// ASSIGNED → IN_PROGRESS.
    pub async fn start(&self, task_id: &str) -> Result<Task> {
        let mut task = self.load(task_id).await?;
        task.transition(TaskStatus::InProgress)?;
        self.store.save_task(&task).await?;
        Ok(task)
    }

    /// IN_PROGRESS → COMPLETED.
    pub async fn complete(&self, task_id: &str, round: u64) -> Result<Task> {
        let mut task = self.load(task_id).await?;
        task.transition(TaskStatus::Completed)?;
        task.completed_round = Some(round);
        self.store.save_task(&task).await?;
        debug!(task_id, round, "Task completed");
        Ok(task)
    }

    /// ASSIGNED or IN_PROGRESS → FAILED.
    pub async fn fail(&self, task_id: &str, round: u64) -> Result<Task> {
        let mut task = self.load(task_id).await?;
        task.transition(TaskStatus::Failed)?;
        task.completed_round = Some(round);
        self.store.save_task(&task).await?;
        info!(task_id, round, agent = ?task.assigned_agent, "Task failed");
        Ok(task)
    }

    /// Expire every OPEN task whose deadline is before `round`.
    pub async fn expire_overdue(&self, round: u64) -> Result<Vec<Task>> {
        let mut expired = Vec::new();
        for mut task in self.open_tasks().await? {
            if task.deadline_round >= round {
                continue;
            }
            task.transition(TaskStatus::Expired)
                .with_context(|| format!("expiring task {}", task.id))?;
            self.store.save_task(&task).await?;
            expired.push(task);
        }
        if !expired.is_empty() {
            info!(round, count = expired.len(), "Expired overdue tasks");
        }
        Ok(expired)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
