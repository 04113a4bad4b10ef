use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One attempted `(provider, endpoint, key)` per row; a request keeps as
/// many rows as it made attempts.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_candidates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub candidate_index: i32,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
    pub client_format: String,
    pub target_format: String,
    pub needs_conversion: bool,
    pub is_cached: bool,
    pub status: String,
    pub status_code: Option<i32>,
    pub latency_ms: Option<i64>,
    pub error_class: Option<String>,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub extra_json: Option<Json>,
}

impl ActiveModelBehavior for ActiveModel {}
