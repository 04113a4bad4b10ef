use sea_orm::entity::prelude::*;

/// Quota columns only; user administration lives outside the core.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub quota_usd: Option<f64>,
    pub used_usd: f64,
    pub enabled: bool,
}

impl ActiveModelBehavior for ActiveModel {}
