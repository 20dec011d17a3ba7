use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Promotional code. `current_user_count` is mutated only through an atomic
/// conditional increment so it can never exceed `max_users`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "coupons")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub code: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_percent: Decimal,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub minimum_order_value: Option<Decimal>,
    pub max_users: Option<i32>,
    pub per_user_limit: bool,
    pub current_user_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::coupon_usage::Entity")]
    Usages,
}

impl Related<super::coupon_usage::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Usages.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
