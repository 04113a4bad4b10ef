use std::sync::Arc;

use prism_catalog::{
    BillingTemplate, BillingType, GlobalModel, ModelBinding, Provider, ProviderKey, TokenBreakdown,
    compute_cost,
};
use prism_codec::UsageInfo;
use prism_common::{ApiFormat, ApiKeyId, UserId};
use prism_storage::{QuotaOutcome, Storage, UsageDraft};

use crate::error::GatewayError;

/// Everything needed to turn a finished attempt's token counts into a
/// usage row; assembled before streaming starts so the completion task
/// owns no catalog references.
#[derive(Clone)]
pub struct UsageContext {
    pub request_id: String,
    pub user_id: Option<UserId>,
    pub api_key_id: ApiKeyId,
    pub standalone_key: bool,
    pub provider: Arc<Provider>,
    pub key: Arc<ProviderKey>,
    pub binding: Arc<ModelBinding>,
    pub global_model: Arc<GlobalModel>,
    pub endpoint_id: i64,
    pub client_format: ApiFormat,
    pub target_format: ApiFormat,
    pub is_stream: bool,
}

impl UsageContext {
    pub fn cost(&self, usage: &UsageInfo) -> f64 {
        let tokens = TokenBreakdown {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_write_tokens,
        };
        // Binding pricing overrides the global model default.
        let pricing = self
            .binding
            .pricing
            .as_ref()
            .or(self.global_model.pricing.as_ref());
        let template = self
            .binding
            .billing_template
            .unwrap_or_else(|| BillingTemplate::for_format(self.target_format));
        compute_cost(
            pricing,
            &tokens,
            template,
            self.key.rate_multiplier.unwrap_or(1.0),
            self.provider.billing_type == BillingType::FreeTier,
        )
    }

    pub fn draft(
        &self,
        usage: &UsageInfo,
        status_code: u16,
        latency_ms: Option<i64>,
        error_kind: Option<String>,
    ) -> UsageDraft {
        UsageDraft {
            request_id: self.request_id.clone(),
            user_id: self.user_id,
            api_key_id: self.api_key_id,
            standalone_key: self.standalone_key,
            provider_id: self.provider.id,
            provider_monthly_quota: self.provider.billing_type == BillingType::MonthlyQuota,
            endpoint_id: self.endpoint_id,
            key_id: self.key.id,
            client_api_format: self.client_format.as_str().to_string(),
            target_api_format: self.target_format.as_str().to_string(),
            model_id: self.global_model.id,
            model_name: self.global_model.name.clone(),
            input_tokens: usage.input_tokens as i64,
            output_tokens: usage.output_tokens as i64,
            cache_read_tokens: usage.cache_read_tokens as i64,
            cache_creation_tokens: usage.cache_write_tokens as i64,
            cost_usd: self.cost(usage),
            status_code: i32::from(status_code),
            latency_ms,
            is_stream: self.is_stream,
            error_kind,
        }
    }
}

pub async fn record_usage(
    storage: &dyn Storage,
    ctx: &UsageContext,
    usage: &UsageInfo,
    status_code: u16,
    latency_ms: Option<i64>,
) -> Result<QuotaOutcome, GatewayError> {
    let draft = ctx.draft(usage, status_code, latency_ms, None);
    storage
        .record_usage(&draft)
        .await
        .map_err(GatewayError::internal)
}

#[cfg(test)]
mod tests {
    use prism_catalog::{KeyAuthKind, ModelCapabilities, PricingTable};

    use super::*;

    fn ctx(billing_type: BillingType, rate_multiplier: Option<f64>) -> UsageContext {
        UsageContext {
            request_id: "req-1".to_string(),
            user_id: Some(1),
            api_key_id: 1,
            standalone_key: false,
            provider: Arc::new(Provider {
                id: 1,
                name: "p1".to_string(),
                priority: 0,
                billing_type,
                monthly_quota_usd: None,
                quota_reset_day: None,
                monthly_used_usd: 0.0,
                enabled: true,
            }),
            key: Arc::new(ProviderKey {
                id: 1,
                provider_id: 1,
                secret: "sk".to_string(),
                auth_kind: KeyAuthKind::ApiKey,
                api_formats: vec![ApiFormat::Claude],
                internal_priority: 0,
                global_priority: None,
                rpm_limit: None,
                learned_rpm_limit: None,
                cache_ttl_minutes: None,
                rate_multiplier,
                allowed_models: None,
                enabled: true,
            }),
            binding: Arc::new(ModelBinding {
                id: 1,
                provider_id: 1,
                global_model_id: 1,
                provider_model_name: "claude-sonnet-4-5".to_string(),
                aliases: Vec::new(),
                pricing: None,
                billing_template: None,
                enabled: true,
            }),
            global_model: Arc::new(GlobalModel {
                id: 1,
                name: "claude-sonnet-4-5".to_string(),
                display_name: "Claude".to_string(),
                capabilities: ModelCapabilities::default(),
                model_aliases: Vec::new(),
                pricing: Some(PricingTable {
                    input_per_million: 3.0,
                    output_per_million: 15.0,
                    cache_read_per_million: 0.3,
                    cache_creation_per_million: 3.75,
                    per_request: None,
                    tiers: None,
                }),
                enabled: true,
            }),
            endpoint_id: 1,
            client_format: ApiFormat::Claude,
            target_format: ApiFormat::Claude,
            is_stream: true,
        }
    }

    #[test]
    fn cost_uses_global_model_pricing_when_binding_has_none() {
        let ctx = ctx(BillingType::PayAsYouGo, None);
        let usage = UsageInfo {
            input_tokens: 3,
            output_tokens: 7,
            ..UsageInfo::default()
        };
        let cost = ctx.cost(&usage);
        let expected = (3.0 * 3.0 + 7.0 * 15.0) / 1_000_000.0;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn free_tier_records_tokens_but_zero_cost() {
        let ctx = ctx(BillingType::FreeTier, None);
        let usage = UsageInfo {
            input_tokens: 100,
            output_tokens: 100,
            ..UsageInfo::default()
        };
        let draft = ctx.draft(&usage, 200, Some(12), None);
        assert_eq!(draft.cost_usd, 0.0);
        assert_eq!(draft.input_tokens, 100);
        assert_eq!(draft.output_tokens, 100);
    }

    #[test]
    fn monthly_quota_flag_follows_billing_type() {
        let ctx = ctx(BillingType::MonthlyQuota, None);
        let draft = ctx.draft(&UsageInfo::default(), 200, None, None);
        assert!(draft.provider_monthly_quota);
    }
}
