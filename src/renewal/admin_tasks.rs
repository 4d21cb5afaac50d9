use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, PgPool, Type};
use tracing::info;
use uuid::Uuid;

use crate::error::AppResult;

/// What the human queue is being asked to look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "admin_task_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AdminTaskCategory {
    RenewalMissingMethod,
    RenewalMissingPrice,
    RenewalCreditFailed,
    RenewalPaymentPending,
    RenewalPaymentFailed,
    RenewalManualReview,
}

impl AdminTaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminTaskCategory::RenewalMissingMethod => "renewal_missing_method",
            AdminTaskCategory::RenewalMissingPrice => "renewal_missing_price",
            AdminTaskCategory::RenewalCreditFailed => "renewal_credit_failed",
            AdminTaskCategory::RenewalPaymentPending => "renewal_payment_pending",
            AdminTaskCategory::RenewalPaymentFailed => "renewal_payment_failed",
            AdminTaskCategory::RenewalManualReview => "renewal_manual_review",
        }
    }
}

/// Escalation record routing an unresolved automation gap to an operator
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AdminTask {
    pub id: Uuid,
    pub task_type: String,
    pub category: AdminTaskCategory,
    pub subscription_id: Option<Uuid>,
    pub order_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub note: Option<String>,
    pub due_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

const SELECT_COLUMNS: &str = r#"
    id, task_type, category, subscription_id, order_id, user_id, note,
    due_at, completed_at, created_at
"#;

pub struct AdminTaskRepository {
    pub pool: PgPool,
}

impl AdminTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a task, idempotently: at most one open task per category per
    /// subscription exists, so repeated sweep ticks refresh the note rather
    /// than flooding the queue.
    pub async fn open_for_subscription(
        &self,
        category: AdminTaskCategory,
        subscription_id: Uuid,
        user_id: Uuid,
        note: &str,
    ) -> AppResult<AdminTask> {
        let task = sqlx::query_as::<_, AdminTask>(&format!(
            r#"
            INSERT INTO admin_tasks (task_type, category, subscription_id, user_id, note, due_at)
            VALUES ('subscription_renewal', $1, $2, $3, $4, NOW())
            ON CONFLICT (category, subscription_id) WHERE completed_at IS NULL
            DO UPDATE SET note = EXCLUDED.note
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(category)
        .bind(subscription_id)
        .bind(user_id)
        .bind(note)
        .fetch_one(&self.pool)
        .await?;

        info!(
            subscription_id = %subscription_id,
            category = category.as_str(),
            "admin task open"
        );
        Ok(task)
    }

    /// Auto-complete the open task once the underlying condition resolves
    pub async fn complete_open(
        &self,
        category: AdminTaskCategory,
        subscription_id: Uuid,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE admin_tasks
            SET completed_at = NOW()
            WHERE category = $1 AND subscription_id = $2 AND completed_at IS NULL
            "#,
        )
        .bind(category)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn list_open(
        &self,
        category: Option<AdminTaskCategory>,
    ) -> AppResult<Vec<AdminTask>> {
        let tasks = sqlx::query_as::<_, AdminTask>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM admin_tasks
            WHERE completed_at IS NULL
              AND ($1::admin_task_category IS NULL OR category = $1)
            ORDER BY due_at ASC
            "#
        ))
        .bind(category)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }
}
