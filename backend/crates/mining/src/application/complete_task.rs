//! Complete Task Use Case

use std::sync::Arc;

use crate::application::settlement::{SettlementService, TaskRewardReceipt};
use crate::domain::repository::{MiningStore, TaskCatalog};
use crate::domain::value_objects::UserId;
use crate::error::{MiningError, MiningResult};

/// Complete Task Use Case
pub struct CompleteTaskUseCase<S, C>
where
    S: MiningStore,
    C: TaskCatalog,
{
    catalog: Arc<C>,
    settlement: Arc<SettlementService<S>>,
}

impl<S, C> CompleteTaskUseCase<S, C>
where
    S: MiningStore,
    C: TaskCatalog,
{
    pub fn new(catalog: Arc<C>, settlement: Arc<SettlementService<S>>) -> Self {
        Self {
            catalog,
            settlement,
        }
    }

    pub async fn execute(&self, user_id: &UserId, task_id: &str) -> MiningResult<TaskRewardReceipt> {
        let task = self
            .catalog
            .find(task_id)
            .await?
            .ok_or_else(|| MiningError::TaskNotFound(task_id.to_string()))?;

        self.settlement.settle_task(user_id, &task).await
    }
}
