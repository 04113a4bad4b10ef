pub mod api_keys;
pub mod providers;
pub mod request_candidates;
pub mod usage_records;
pub mod users;

pub use api_keys::Entity as ApiKeys;
pub use providers::Entity as Providers;
pub use request_candidates::Entity as RequestCandidates;
pub use usage_records::Entity as UsageRecords;
pub use users::Entity as Users;
