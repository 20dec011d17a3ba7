use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Order lifecycle, persisted as a string column.
///
/// `PendingPayment` is the checkout-time state; `Processing` is the
/// fulfillment-triggering state the payment reconciler (or an admin) moves
/// the order into once payment is captured.
#[derive(
    Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize, ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Processing => "processing",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Refunded => "refunded",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// Legal lifecycle transitions. Rewriting the current status is treated
    /// as a no-op by callers, not a transition.
    pub fn can_transition_to(&self, next: &OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (PendingPayment, Processing)
                | (PendingPayment, Cancelled)
                | (Processing, Delivered)
                | (Processing, Refunded)
                | (Processing, Cancelled)
                | (Delivered, Refunded)
        )
    }

    /// The status whose transition-into commits inventory.
    pub fn triggers_fulfillment(&self) -> bool {
        matches!(self, OrderStatus::Processing)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The central transactional entity. The line-item snapshot lives in
/// `order_items` and is write-once; payment fields are written only through
/// the reconciler's conditional updates; `inventory_committed` gates the
/// exactly-once stock decrement.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub payment_method: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_before_discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_saved: Decimal,
    pub coupon_code: Option<String>,
    #[sea_orm(column_type = "Json")]
    pub shipping_address: Json,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub razorpay_order_id: Option<String>,
    pub razorpay_payment_id: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub payment_result: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub payment_details: Option<Json>,
    #[sea_orm(column_type = "Json", nullable)]
    pub refund_details: Option<Json>,
    pub inventory_committed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    Items,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Items.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::OrderStatus;
    use test_case::test_case;

    #[test_case(OrderStatus::PendingPayment, OrderStatus::Processing, true)]
    #[test_case(OrderStatus::PendingPayment, OrderStatus::Cancelled, true)]
    #[test_case(OrderStatus::PendingPayment, OrderStatus::Delivered, false)]
    #[test_case(OrderStatus::PendingPayment, OrderStatus::Refunded, false)]
    #[test_case(OrderStatus::Processing, OrderStatus::Delivered, true)]
    #[test_case(OrderStatus::Processing, OrderStatus::Refunded, true)]
    #[test_case(OrderStatus::Delivered, OrderStatus::Refunded, true)]
    #[test_case(OrderStatus::Refunded, OrderStatus::Processing, false)]
    #[test_case(OrderStatus::Cancelled, OrderStatus::Processing, false)]
    fn transition_table(from: OrderStatus, to: OrderStatus, allowed: bool) {
        assert_eq!(from.can_transition_to(&to), allowed);
    }

    #[test]
    fn only_processing_triggers_fulfillment() {
        assert!(OrderStatus::Processing.triggers_fulfillment());
        assert!(!OrderStatus::PendingPayment.triggers_fulfillment());
        assert!(!OrderStatus::Delivered.triggers_fulfillment());
        assert!(!OrderStatus::Refunded.triggers_fulfillment());
        assert!(!OrderStatus::Cancelled.triggers_fulfillment());
    }
}
