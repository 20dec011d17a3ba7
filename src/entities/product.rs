use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Catalog item. Stock lives on the per-size variants; `sold` here is the
/// product-level aggregate and only ever increases.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub title: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,
    pub image: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub discount_percent: Decimal,
    pub is_best_seller: bool,
    pub is_featured: bool,
    pub sold: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product_size::Entity")]
    Sizes,
}

impl Related<super::product_size::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Sizes.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
