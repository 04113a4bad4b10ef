mod candidates;
mod entities;
mod permissions;
mod pricing;
mod resolve;
mod snapshot;

pub use candidates::{
    Candidate, CandidateError, CandidateQuery, build_candidates, promote_affinity,
};
pub use entities::{
    AllowedModels, BillingType, ClientKey, Endpoint, FormatAcceptance, GatewayPolicy, GlobalModel,
    HeaderRule, KeyAuthKind, ModelBinding, ModelCapabilities, PriorityMode, Provider, ProviderKey,
    User,
};
pub use permissions::{model_allowed, pattern_matches};
pub use pricing::{BillingTemplate, PriceTier, PricingTable, TokenBreakdown, compute_cost};
pub use resolve::{ResolvedModel, resolve_model_name};
pub use snapshot::{CatalogHandle, CatalogSnapshot};
