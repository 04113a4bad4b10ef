use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "usage_record_request_id")]
    pub request_id: String,
    pub user_id: Option<i64>,
    pub api_key_id: i64,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub key_id: i64,
    pub client_api_format: String,
    pub target_api_format: String,
    pub model_id: i64,
    pub model_name: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost_usd: f64,
    pub status_code: i32,
    pub latency_ms: Option<i64>,
    pub is_stream: bool,
    pub error_kind: Option<String>,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
