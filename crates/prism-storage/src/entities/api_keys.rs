use sea_orm::entity::prelude::*;

/// Balance columns for standalone keys; key administration lives outside
/// the core.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: Option<i64>,
    pub standalone: bool,
    pub balance_usd: Option<f64>,
    pub balance_used_usd: f64,
    pub enabled: bool,
}

impl ActiveModelBehavior for ActiveModel {}
