use async_trait::async_trait;
use time::OffsetDateTime;

use prism_common::{ApiKeyId, EndpointId, GlobalModelId, KeyId, ProviderId, UserId};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    Pending,
    Started,
    Streaming,
    Success,
    Failed,
}

impl CandidateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Started => "started",
            CandidateStatus::Streaming => "streaming",
            CandidateStatus::Success => "success",
            CandidateStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CandidateDraft {
    pub request_id: String,
    pub candidate_index: i32,
    pub provider_id: ProviderId,
    pub endpoint_id: EndpointId,
    pub key_id: KeyId,
    pub client_format: String,
    pub target_format: String,
    pub needs_conversion: bool,
    pub is_cached: bool,
    pub status: CandidateStatus,
    pub status_code: Option<i32>,
    pub latency_ms: Option<i64>,
    pub error_class: Option<String>,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
    pub extra_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct UsageDraft {
    pub request_id: String,
    pub user_id: Option<UserId>,
    pub api_key_id: ApiKeyId,
    pub standalone_key: bool,
    pub provider_id: ProviderId,
    pub provider_monthly_quota: bool,
    pub endpoint_id: EndpointId,
    pub key_id: KeyId,
    pub client_api_format: String,
    pub target_api_format: String,
    pub model_id: GlobalModelId,
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    Recorded,
    /// The conditional decrement matched no row: the charge would push the
    /// account past its quota. Nothing was written.
    QuotaExceeded,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub candidate_days: i64,
    pub usage_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            candidate_days: 30,
            usage_days: 180,
        }
    }
}

/// Durable side of the dispatch pipeline.
///
/// `record_usage` is the only multi-statement transaction: the usage row
/// and the quota decrement commit or fail together. Candidate telemetry
/// uses short independent writes so a telemetry failure cannot mask a
/// successful response.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn sync(&self) -> StorageResult<()>;

    /// Insert the usage row and atomically charge the paying account
    /// (`used_usd` for user-bound keys, `balance_used_usd` for standalone
    /// keys, plus the provider's monthly counter when applicable).
    async fn record_usage(&self, draft: &UsageDraft) -> StorageResult<QuotaOutcome>;

    async fn insert_candidate(&self, draft: &CandidateDraft) -> StorageResult<()>;

    /// Rows are addressed by their natural key: one request has at most
    /// one row per candidate index.
    async fn update_candidate(
        &self,
        request_id: &str,
        candidate_index: i32,
        status: CandidateStatus,
        status_code: Option<i32>,
        latency_ms: Option<i64>,
        error_class: Option<String>,
    ) -> StorageResult<()>;

    /// Retention cleanup; returns deleted row counts (candidates, usage).
    async fn cleanup(&self, policy: &RetentionPolicy) -> StorageResult<(u64, u64)>;
}

/// No-op storage for tests and metering-disabled deployments.
#[derive(Debug, Default)]
pub struct NullStorage;

#[async_trait]
impl Storage for NullStorage {
    async fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn record_usage(&self, _draft: &UsageDraft) -> StorageResult<QuotaOutcome> {
        Ok(QuotaOutcome::Recorded)
    }

    async fn insert_candidate(&self, _draft: &CandidateDraft) -> StorageResult<()> {
        Ok(())
    }

    async fn update_candidate(
        &self,
        _request_id: &str,
        _candidate_index: i32,
        _status: CandidateStatus,
        _status_code: Option<i32>,
        _latency_ms: Option<i64>,
        _error_class: Option<String>,
    ) -> StorageResult<()> {
        Ok(())
    }

    async fn cleanup(&self, _policy: &RetentionPolicy) -> StorageResult<(u64, u64)> {
        Ok((0, 0))
    }
}
