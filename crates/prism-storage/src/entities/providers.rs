use sea_orm::entity::prelude::*;

/// Monthly-quota accounting columns; provider configuration is read from
/// the catalog snapshot, not from here.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub monthly_quota_usd: Option<f64>,
    pub monthly_used_usd: f64,
    pub quota_reset_day: Option<i32>,
    pub enabled: bool,
}

impl ActiveModelBehavior for ActiveModel {}
