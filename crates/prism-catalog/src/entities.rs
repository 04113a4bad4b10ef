use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use prism_common::{
    ApiFormat, ApiKeyId, EndpointId, GlobalModelId, Headers, KeyId, ProviderId, UserId,
};

use crate::pricing::{BillingTemplate, PricingTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    PayAsYouGo,
    MonthlyQuota,
    FreeTier,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub function_calling: bool,
    #[serde(default)]
    pub extended_thinking: bool,
    #[serde(default)]
    pub image_generation: bool,
}

/// Canonical model exposed to clients. `name` is unique; `model_aliases`
/// are anchored, case-insensitive regex patterns applied at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModel {
    pub id: GlobalModelId,
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub capabilities: ModelCapabilities,
    #[serde(default)]
    pub model_aliases: Vec<String>,
    pub pricing: Option<PricingTable>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    /// Lower sorts earlier in candidate order.
    pub priority: i32,
    pub billing_type: BillingType,
    pub monthly_quota_usd: Option<f64>,
    /// Day of month the monthly quota resets (1..=28).
    pub quota_reset_day: Option<u8>,
    #[serde(default)]
    pub monthly_used_usd: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HeaderRule {
    Set { name: String, value: String },
    Drop { name: String },
    Rename { from: String, to: String },
}

/// Which client formats an endpoint admits when conversion would be
/// required. Absent means the endpoint only serves its native format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatAcceptance {
    pub enabled: bool,
    #[serde(default)]
    pub accept_formats: Vec<ApiFormat>,
    #[serde(default)]
    pub reject_formats: Vec<ApiFormat>,
    #[serde(default = "default_true")]
    pub stream_conversion: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    pub provider_id: ProviderId,
    pub api_format: ApiFormat,
    pub base_url: String,
    /// Overrides the format's default upstream path.
    pub custom_path: Option<String>,
    #[serde(default)]
    pub static_headers: Headers,
    #[serde(default)]
    pub header_rules: Vec<HeaderRule>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    pub format_acceptance: Option<FormatAcceptance>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAuthKind {
    ApiKey,
    OAuth,
}

/// Allowed-model whitelist; `None` at the field level means unrestricted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowedModels {
    List(Vec<String>),
    /// Keyed by `ApiFormat` name, with `"*"` as the fallback bucket.
    ByFormat(BTreeMap<String, Vec<String>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderKey {
    pub id: KeyId,
    pub provider_id: ProviderId,
    pub secret: String,
    pub auth_kind: KeyAuthKind,
    /// Formats this credential can authenticate against.
    pub api_formats: Vec<ApiFormat>,
    /// Tie-break within one provider.
    pub internal_priority: i32,
    /// Cross-provider rank in global-key priority mode; `None` sorts last.
    pub global_priority: Option<i32>,
    /// `None` puts the key in adaptive mode.
    pub rpm_limit: Option<u32>,
    pub learned_rpm_limit: Option<u32>,
    pub cache_ttl_minutes: Option<u32>,
    pub rate_multiplier: Option<f64>,
    pub allowed_models: Option<AllowedModels>,
    pub enabled: bool,
}

/// Binds a GlobalModel to the name and pricing one provider uses for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBinding {
    pub id: i64,
    pub provider_id: ProviderId,
    pub global_model_id: GlobalModelId,
    pub provider_model_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub pricing: Option<PricingTable>,
    pub billing_template: Option<BillingTemplate>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// `None` or negative means unlimited.
    pub quota_usd: Option<f64>,
    #[serde(default)]
    pub used_usd: f64,
    pub allowed_providers: Option<Vec<ProviderId>>,
    pub allowed_api_formats: Option<Vec<ApiFormat>>,
    pub allowed_models: Option<AllowedModels>,
    pub enabled: bool,
}

/// Client-facing credential. Standalone keys bill against their own
/// balance instead of the owning user's quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientKey {
    pub id: ApiKeyId,
    pub user_id: Option<UserId>,
    pub key_hash: String,
    #[serde(default)]
    pub standalone: bool,
    pub balance_usd: Option<f64>,
    #[serde(default)]
    pub balance_used_usd: f64,
    pub allowed_providers: Option<Vec<ProviderId>>,
    pub allowed_api_formats: Option<Vec<ApiFormat>>,
    pub allowed_models: Option<AllowedModels>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityMode {
    Provider,
    GlobalKey,
}

/// Global routing switches, administered outside the hot path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPolicy {
    pub format_conversion_enabled: bool,
    pub priority_mode: PriorityMode,
    pub max_attempts: usize,
    pub default_affinity_ttl_minutes: u32,
}

impl Default for GatewayPolicy {
    fn default() -> Self {
        Self {
            format_conversion_enabled: true,
            priority_mode: PriorityMode::Provider,
            max_attempts: 5,
            default_affinity_ttl_minutes: 60,
        }
    }
}
