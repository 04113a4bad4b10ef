use async_trait::async_trait;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::{
    ActiveValue, ColumnTrait, Condition, Database, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Schema, TransactionTrait,
};
use time::{Duration, OffsetDateTime};

use crate::entities;
use crate::storage::{
    CandidateDraft, CandidateStatus, QuotaOutcome, RetentionPolicy, Storage, StorageError,
    StorageResult, UsageDraft,
};

/// SeaORM-backed storage. One connection pool per process; entities sync
/// their schema at bootstrap.
pub struct DbStorage {
    db: DatabaseConnection,
}

impl DbStorage {
    pub async fn connect(database_url: &str) -> Result<Self, DbErr> {
        Ok(Self {
            db: Database::connect(database_url).await?,
        })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Storage for DbStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::Users)
            .register(entities::ApiKeys)
            .register(entities::Providers)
            .register(entities::UsageRecords)
            .register(entities::RequestCandidates)
            .sync(&self.db)
            .await?;
        Ok(())
    }

    async fn record_usage(&self, draft: &UsageDraft) -> StorageResult<QuotaOutcome> {
        let txn = self.db.begin().await?;
        let now = OffsetDateTime::now_utc();

        let active = entities::usage_records::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(draft.request_id.clone()),
            user_id: ActiveValue::Set(draft.user_id),
            api_key_id: ActiveValue::Set(draft.api_key_id),
            provider_id: ActiveValue::Set(draft.provider_id),
            endpoint_id: ActiveValue::Set(draft.endpoint_id),
            key_id: ActiveValue::Set(draft.key_id),
            client_api_format: ActiveValue::Set(draft.client_api_format.clone()),
            target_api_format: ActiveValue::Set(draft.target_api_format.clone()),
            model_id: ActiveValue::Set(draft.model_id),
            model_name: ActiveValue::Set(draft.model_name.clone()),
            input_tokens: ActiveValue::Set(draft.input_tokens),
            output_tokens: ActiveValue::Set(draft.output_tokens),
            cache_read_tokens: ActiveValue::Set(draft.cache_read_tokens),
            cache_creation_tokens: ActiveValue::Set(draft.cache_creation_tokens),
            cost_usd: ActiveValue::Set(draft.cost_usd),
            status_code: ActiveValue::Set(draft.status_code),
            latency_ms: ActiveValue::Set(draft.latency_ms),
            is_stream: ActiveValue::Set(draft.is_stream),
            error_kind: ActiveValue::Set(draft.error_kind.clone()),
            created_at: ActiveValue::Set(now),
        };
        entities::UsageRecords::insert(active).exec(&txn).await?;

        let cost = draft.cost_usd;
        if cost > 0.0 {
            let charged = if draft.standalone_key {
                charge_api_key(&txn, draft.api_key_id, cost).await?
            } else if let Some(user_id) = draft.user_id {
                charge_user(&txn, user_id, cost).await?
            } else {
                true
            };
            if !charged {
                txn.rollback().await?;
                return Ok(QuotaOutcome::QuotaExceeded);
            }

            if draft.provider_monthly_quota {
                entities::Providers::update_many()
                    .col_expr(
                        entities::providers::Column::MonthlyUsedUsd,
                        Expr::col(entities::providers::Column::MonthlyUsedUsd).add(cost),
                    )
                    .filter(entities::providers::Column::Id.eq(draft.provider_id))
                    .exec(&txn)
                    .await?;
            }
        }

        txn.commit().await?;
        Ok(QuotaOutcome::Recorded)
    }

    async fn insert_candidate(&self, draft: &CandidateDraft) -> StorageResult<()> {
        let active = entities::request_candidates::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(draft.request_id.clone()),
            candidate_index: ActiveValue::Set(draft.candidate_index),
            provider_id: ActiveValue::Set(draft.provider_id),
            endpoint_id: ActiveValue::Set(draft.endpoint_id),
            key_id: ActiveValue::Set(draft.key_id),
            client_format: ActiveValue::Set(draft.client_format.clone()),
            target_format: ActiveValue::Set(draft.target_format.clone()),
            needs_conversion: ActiveValue::Set(draft.needs_conversion),
            is_cached: ActiveValue::Set(draft.is_cached),
            status: ActiveValue::Set(draft.status.as_str().to_string()),
            status_code: ActiveValue::Set(draft.status_code),
            latency_ms: ActiveValue::Set(draft.latency_ms),
            error_class: ActiveValue::Set(draft.error_class.clone()),
            started_at: ActiveValue::Set(draft.started_at),
            finished_at: ActiveValue::Set(draft.finished_at),
            extra_json: ActiveValue::Set(draft.extra_json.clone()),
        };
        entities::RequestCandidates::insert(active)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_candidate(
        &self,
        request_id: &str,
        candidate_index: i32,
        status: CandidateStatus,
        status_code: Option<i32>,
        latency_ms: Option<i64>,
        error_class: Option<String>,
    ) -> StorageResult<()> {
        let finished = matches!(status, CandidateStatus::Success | CandidateStatus::Failed);
        let mut update = entities::RequestCandidates::update_many()
            .col_expr(
                entities::request_candidates::Column::Status,
                Expr::value(status.as_str()),
            )
            .filter(entities::request_candidates::Column::RequestId.eq(request_id))
            .filter(entities::request_candidates::Column::CandidateIndex.eq(candidate_index));
        if let Some(code) = status_code {
            update = update.col_expr(
                entities::request_candidates::Column::StatusCode,
                Expr::value(code),
            );
        }
        if let Some(latency) = latency_ms {
            update = update.col_expr(
                entities::request_candidates::Column::LatencyMs,
                Expr::value(latency),
            );
        }
        if let Some(error) = error_class {
            update = update.col_expr(
                entities::request_candidates::Column::ErrorClass,
                Expr::value(error),
            );
        }
        if finished {
            update = update.col_expr(
                entities::request_candidates::Column::FinishedAt,
                Expr::value(OffsetDateTime::now_utc()),
            );
        }
        update.exec(&self.db).await?;
        Ok(())
    }

    async fn cleanup(&self, policy: &RetentionPolicy) -> StorageResult<(u64, u64)> {
        let now = OffsetDateTime::now_utc();
        let candidate_cutoff = now - Duration::days(policy.candidate_days);
        let usage_cutoff = now - Duration::days(policy.usage_days);

        let candidates = entities::RequestCandidates::delete_many()
            .filter(entities::request_candidates::Column::StartedAt.lt(candidate_cutoff))
            .exec(&self.db)
            .await?
            .rows_affected;
        let usage = entities::UsageRecords::delete_many()
            .filter(entities::usage_records::Column::CreatedAt.lt(usage_cutoff))
            .exec(&self.db)
            .await?
            .rows_affected;
        Ok((candidates, usage))
    }
}

/// Conditional decrement: only succeeds while the charge keeps `used_usd`
/// within quota. Zero affected rows means the quota is exhausted.
async fn charge_user(
    txn: &sea_orm::DatabaseTransaction,
    user_id: i64,
    cost: f64,
) -> Result<bool, StorageError> {
    let result = entities::Users::update_many()
        .col_expr(
            entities::users::Column::UsedUsd,
            Expr::col(entities::users::Column::UsedUsd).add(cost),
        )
        .filter(entities::users::Column::Id.eq(user_id))
        .filter(
            Condition::any()
                .add(entities::users::Column::QuotaUsd.is_null())
                .add(entities::users::Column::QuotaUsd.lt(0.0))
                .add(
                    Expr::col(entities::users::Column::UsedUsd)
                        .add(cost)
                        .lte(Expr::col(entities::users::Column::QuotaUsd)),
                ),
        )
        .exec(txn)
        .await?;
    Ok(result.rows_affected > 0)
}

async fn charge_api_key(
    txn: &sea_orm::DatabaseTransaction,
    api_key_id: i64,
    cost: f64,
) -> Result<bool, StorageError> {
    let result = entities::ApiKeys::update_many()
        .col_expr(
            entities::api_keys::Column::BalanceUsedUsd,
            Expr::col(entities::api_keys::Column::BalanceUsedUsd).add(cost),
        )
        .filter(entities::api_keys::Column::Id.eq(api_key_id))
        .filter(
            Condition::any()
                .add(entities::api_keys::Column::BalanceUsd.is_null())
                .add(
                    Expr::col(entities::api_keys::Column::BalanceUsedUsd)
                        .add(cost)
                        .lte(Expr::col(entities::api_keys::Column::BalanceUsd)),
                ),
        )
        .exec(txn)
        .await?;
    Ok(result.rows_affected > 0)
}
