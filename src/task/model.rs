//! # 异步任务存储
//!
//! 任务行的写入与查询。状态迁移一律通过 `update_with_status` 以期望的旧状态为条件,
//! 多个轮询实例同时推进同一任务时只有一个会成功。

use std::sync::Arc;

use entity::tasks::{self, TaskPrivateData, TaskProperties, TaskStatus};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect,
};

use crate::error::Result;
use crate::types::Usage;

/// 提交成功后写入的任务
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub task_id: String,
    pub platform: String,
    pub user_id: i32,
    pub group: String,
    pub channel_id: i32,
    pub action: String,
    /// 提交时已经扣除的额度
    pub quota: i64,
    pub properties: TaskProperties,
    pub private_data: TaskPrivateData,
}

/// 上游轮询得到的任务进展
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub progress: Option<String>,
    pub fail_reason: Option<String>,
    pub result_url: Option<String>,
    /// 完成时上游上报的用量
    pub usage: Option<Usage>,
}

impl TaskUpdate {
    #[must_use]
    pub const fn status(status: TaskStatus) -> Self {
        Self {
            status,
            progress: None,
            fail_reason: None,
            result_url: None,
            usage: None,
        }
    }

    #[must_use]
    pub fn success(usage: Option<Usage>) -> Self {
        Self {
            progress: Some("100%".to_string()),
            usage,
            ..Self::status(TaskStatus::Success)
        }
    }

    #[must_use]
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            progress: Some("100%".to_string()),
            fail_reason: Some(reason.into()),
            ..Self::status(TaskStatus::Failure)
        }
    }
}

/// 任务存储
pub struct TaskStore {
    db: Arc<DatabaseConnection>,
}

impl TaskStore {
    #[must_use]
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// 记录一次成功的提交
    pub async fn record_submission(&self, task: NewTask) -> Result<tasks::Model> {
        let now = chrono::Utc::now().timestamp();
        let row = tasks::ActiveModel {
            task_id: Set(task.task_id),
            platform: Set(task.platform),
            user_id: Set(task.user_id),
            group: Set(task.group),
            channel_id: Set(task.channel_id),
            quota: Set(task.quota),
            action: Set(task.action),
            status: Set(TaskStatus::Submitted),
            fail_reason: Set(None),
            submit_time: Set(now),
            start_time: Set(0),
            finish_time: Set(0),
            progress: Set("0%".to_string()),
            properties: Set(Some(serde_json::to_string(&task.properties)?)),
            private_data: Set(Some(serde_json::to_string(&task.private_data)?)),
            ..Default::default()
        }
        .insert(self.db.as_ref())
        .await?;
        Ok(row)
    }

    pub async fn find_by_task_id(&self, task_id: &str) -> Result<Option<tasks::Model>> {
        let task = tasks::Entity::find()
            .filter(tasks::Column::TaskId.eq(task_id))
            .one(self.db.as_ref())
            .await?;
        Ok(task)
    }

    /// 未完成的任务, 按提交时间升序
    pub async fn get_unfinished(&self, limit: u64) -> Result<Vec<tasks::Model>> {
        let rows = tasks::Entity::find()
            .filter(tasks::Column::Status.is_in(TaskStatus::unfinished()))
            .order_by_asc(tasks::Column::SubmitTime)
            .order_by_asc(tasks::Column::Id)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }

    /// 提交时间早于 `cutoff` 仍未完成的任务
    pub async fn get_timed_out_unfinished(&self, cutoff: i64, limit: u64) -> Result<Vec<tasks::Model>> {
        let rows = tasks::Entity::find()
            .filter(tasks::Column::Status.is_in(TaskStatus::unfinished()))
            .filter(tasks::Column::SubmitTime.lt(cutoff))
            .order_by_asc(tasks::Column::SubmitTime)
            .order_by_asc(tasks::Column::Id)
            .limit(limit)
            .all(self.db.as_ref())
            .await?;
        Ok(rows)
    }

    /// 仅当数据库中的状态仍为 `expected` 时写入, 返回是否写入成功
    pub async fn update_with_status(&self, task: &tasks::Model, expected: TaskStatus) -> Result<bool> {
        let result = tasks::Entity::update_many()
            .col_expr(tasks::Column::Status, Expr::value(task.status.to_value()))
            .col_expr(tasks::Column::Progress, Expr::value(task.progress.clone()))
            .col_expr(tasks::Column::FailReason, Expr::value(task.fail_reason.clone()))
            .col_expr(tasks::Column::StartTime, Expr::value(task.start_time))
            .col_expr(tasks::Column::FinishTime, Expr::value(task.finish_time))
            .col_expr(tasks::Column::PrivateData, Expr::value(task.private_data.clone()))
            .col_expr(tasks::Column::UpdatedAt, Expr::current_timestamp().into())
            .filter(tasks::Column::Id.eq(task.id))
            .filter(tasks::Column::Status.eq(expected))
            .exec(self.db.as_ref())
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// 结算后写回任务的最终额度
    pub async fn set_quota(&self, id: i32, quota: i64) -> Result<()> {
        tasks::Entity::update_many()
            .col_expr(tasks::Column::Quota, Expr::value(quota))
            .col_expr(tasks::Column::UpdatedAt, Expr::current_timestamp().into())
            .filter(tasks::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::create_test_db;

    fn new_task(task_id: &str) -> NewTask {
        NewTask {
            task_id: task_id.to_string(),
            platform: "video".to_string(),
            user_id: 1,
            group: "default".to_string(),
            channel_id: 1,
            action: "generate".to_string(),
            quota: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_update_with_status_requires_expected() {
        let db = Arc::new(create_test_db().await.unwrap());
        let store = TaskStore::new(db);
        let task = store.record_submission(new_task("t-1")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);

        let mut running = task.clone();
        running.status = TaskStatus::InProgress;
        assert!(store.update_with_status(&running, TaskStatus::Submitted).await.unwrap());
        assert!(!store.update_with_status(&running, TaskStatus::Submitted).await.unwrap());

        let row = store.find_by_task_id("t-1").await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn test_unfinished_queries() {
        let db = Arc::new(create_test_db().await.unwrap());
        let store = TaskStore::new(db);
        let first = store.record_submission(new_task("t-a")).await.unwrap();
        let second = store.record_submission(new_task("t-b")).await.unwrap();

        let mut done = second.clone();
        done.status = TaskStatus::Success;
        store.update_with_status(&done, TaskStatus::Submitted).await.unwrap();

        let unfinished = store.get_unfinished(10).await.unwrap();
        assert_eq!(unfinished.iter().map(|t| t.id).collect::<Vec<_>>(), vec![first.id]);
        assert!(store.get_timed_out_unfinished(first.submit_time, 10).await.unwrap().is_empty());
        assert_eq!(
            store.get_timed_out_unfinished(first.submit_time + 1, 10).await.unwrap().len(),
            1
        );
    }
}
