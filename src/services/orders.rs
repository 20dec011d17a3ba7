use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    entities::{
        order::{self, Entity as OrderEntity, Model as OrderModel, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        catalog::parse_product_ref,
        coupons::{CouponDecision, CouponService},
        inventory::InventoryService,
        notifications::{NotificationGateway, StorefrontNotification},
    },
};

/// Amount saved for a given pre-discount total and percent, rounded to
/// currency precision.
pub fn discount_amount(total_before_discount: Decimal, percent: Decimal) -> Decimal {
    (total_before_discount * percent / Decimal::from(100)).round_dp(2)
}

fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

/// Shipping address snapshot captured at checkout.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct ShippingAddress {
    #[validate(length(min = 1, message = "First name is required"))]
    pub first_name: String,
    #[validate(length(min = 1, message = "Last name is required"))]
    pub last_name: String,
    #[validate(length(min = 1, message = "Phone number is required"))]
    pub phone_number: String,
    #[validate(length(min = 1, message = "Address is required"))]
    pub address1: String,
    pub address2: Option<String>,
    #[validate(length(min = 1, message = "City is required"))]
    pub city: String,
    #[validate(length(min = 1, message = "State is required"))]
    pub state: String,
    #[validate(length(min = 1, message = "Zip code is required"))]
    pub zip_code: String,
    #[validate(length(min = 1, message = "Country is required"))]
    pub country: String,
}

/// One cart line handed to the assembler. The price is already resolved by
/// the caller from catalog state at add-to-cart time; the assembler snapshots
/// it without re-pricing. `product_id` tolerates the composite
/// `"{productId}_{size}"` encoding.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct OrderLineInput {
    #[validate(length(min = 1, message = "Product reference is required"))]
    pub product_id: String,
    pub size: Option<String>,
    #[validate(length(min = 1, message = "Product name is required"))]
    pub name: String,
    pub image: Option<String>,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
    #[validate(custom = "validate_positive_decimal")]
    pub unit_price: Decimal,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    pub user_id: Uuid,
    #[validate(length(min = 1, message = "Order must contain at least one line item"))]
    pub items: Vec<OrderLineInput>,
    pub shipping_address: ShippingAddress,
    #[validate(length(min = 1, message = "Payment method is required"))]
    pub payment_method: String,
    pub coupon_code: Option<String>,
    /// Gateway-side order id created before checkout opens; correlates the
    /// webhook and verification callbacks back to this order.
    pub razorpay_order_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: OrderStatus,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub size_label: String,
    pub name: String,
    pub image: Option<String>,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub status: OrderStatus,
    pub payment_method: String,
    pub total: Decimal,
    pub total_before_discount: Decimal,
    pub total_saved: Decimal,
    pub coupon_code: Option<String>,
    pub shipping_address: serde_json::Value,
    pub is_paid: bool,
    pub paid_at: Option<DateTime<Utc>>,
    pub razorpay_order_id: Option<String>,
    pub razorpay_payment_id: Option<String>,
    pub payment_result: Option<serde_json::Value>,
    pub payment_details: Option<serde_json::Value>,
    pub refund_details: Option<serde_json::Value>,
    pub inventory_committed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderListResponse {
    pub orders: Vec<OrderResponse>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

/// Builds immutable order snapshots and owns admin status transitions.
#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    coupons: Arc<CouponService>,
    inventory: Arc<InventoryService>,
    notifier: Arc<dyn NotificationGateway>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        coupons: Arc<CouponService>,
        inventory: Arc<InventoryService>,
        notifier: Arc<dyn NotificationGateway>,
    ) -> Self {
        Self {
            db,
            event_sender,
            coupons,
            inventory,
            notifier,
        }
    }

    /// Persists one order with its line-item and address snapshots, redeeming
    /// the coupon (if any) in the same transaction. The confirmation
    /// notification is best-effort: the order is the durable source of truth.
    #[instrument(skip(self, request), fields(user_id = %request.user_id))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request.validate()?;
        request.shipping_address.validate()?;

        let mut lines = Vec::with_capacity(request.items.len());
        let mut total_before_discount = Decimal::ZERO;
        for item in &request.items {
            item.validate()?;
            let (product_id, embedded_size) = parse_product_ref(&item.product_id)?;
            let size_label = item
                .size
                .clone()
                .or(embedded_size)
                .ok_or_else(|| {
                    ServiceError::ValidationError(format!(
                        "Line item '{}' is missing a size",
                        item.name
                    ))
                })?;
            let line_total = item.unit_price * Decimal::from(item.quantity);
            total_before_discount += line_total;
            lines.push((product_id, size_label, item.clone(), line_total));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order_number = format!("ORD-{}", order_id.to_string()[..8].to_uppercase());

        let txn = self.db.begin().await?;

        let mut total_saved = Decimal::ZERO;
        let mut redeemed = None;
        if let Some(code) = request.coupon_code.as_deref() {
            match self
                .coupons
                .redeem_in(&txn, code, request.user_id, total_before_discount)
                .await
            {
                Ok(CouponDecision::Approved(approved)) => {
                    total_saved =
                        discount_amount(total_before_discount, approved.discount_percent);
                    redeemed = Some(approved);
                }
                Ok(CouponDecision::Rejected(rejection)) => {
                    txn.rollback().await.ok();
                    return Err(ServiceError::ValidationError(
                        rejection.user_message().to_string(),
                    ));
                }
                Err(err) => {
                    txn.rollback().await.ok();
                    return Err(err);
                }
            }
        }
        let total = total_before_discount - total_saved;

        let address_snapshot = serde_json::to_value(&request.shipping_address)
            .map_err(|e| ServiceError::SerializationError(e.to_string()))?;

        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(order_number.clone()),
            user_id: Set(request.user_id),
            status: Set(OrderStatus::PendingPayment),
            payment_method: Set(request.payment_method.clone()),
            total: Set(total),
            total_before_discount: Set(total_before_discount),
            total_saved: Set(total_saved),
            coupon_code: Set(redeemed.as_ref().map(|approved| approved.code.clone())),
            shipping_address: Set(address_snapshot),
            is_paid: Set(false),
            paid_at: Set(None),
            razorpay_order_id: Set(request.razorpay_order_id.clone()),
            razorpay_payment_id: Set(None),
            payment_result: Set(None),
            payment_details: Set(None),
            refund_details: Set(None),
            inventory_committed: Set(false),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };
        let order = order_model.insert(&txn).await?;

        for (product_id, size_label, item, line_total) in &lines {
            let item_model = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(*product_id),
                size_label: Set(size_label.clone()),
                name: Set(item.name.clone()),
                image: Set(item.image.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                line_total: Set(*line_total),
            };
            item_model.insert(&txn).await?;
        }

        txn.commit().await?;

        info!(
            order_id = %order_id,
            order_number = %order_number,
            total = %total,
            "Order created"
        );

        if let Err(e) = self.event_sender.send(Event::OrderCreated(order_id)).await {
            warn!(error = %e, order_id = %order_id, "Failed to send order created event");
        }
        if let Some(approved) = redeemed {
            let _ = self
                .event_sender
                .send(Event::CouponRedeemed {
                    coupon_id: approved.coupon_id,
                    user_id: request.user_id,
                    code: approved.code,
                })
                .await;
        }

        // Confirmation dispatch never rolls back or fails the order.
        if let Err(err) = self
            .notifier
            .deliver(StorefrontNotification::OrderConfirmation {
                order_id,
                order_number: order_number.clone(),
                user_id: request.user_id,
                total: total.to_string(),
            })
            .await
        {
            warn!(order_id = %order_id, error = %err, "Order confirmation dispatch failed");
        }

        Ok(Self::model_to_response(order))
    }

    /// Retrieves an order by ID
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<Option<OrderResponse>, ServiceError> {
        let order = OrderEntity::find_by_id(order_id).one(&*self.db).await?;
        Ok(order.map(Self::model_to_response))
    }

    /// Retrieves an order by its human-facing order number
    #[instrument(skip(self), fields(order_number = %order_number))]
    pub async fn get_order_by_number(
        &self,
        order_number: &str,
    ) -> Result<Option<OrderResponse>, ServiceError> {
        let order = OrderEntity::find()
            .filter(order::Column::OrderNumber.eq(order_number))
            .one(&*self.db)
            .await?;
        Ok(order.map(Self::model_to_response))
    }

    /// Line-item snapshot for an order
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order_items(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<OrderItemResponse>, ServiceError> {
        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&*self.db)
            .await?;
        Ok(items
            .into_iter()
            .map(|item| OrderItemResponse {
                id: item.id,
                product_id: item.product_id,
                size_label: item.size_label,
                name: item.name,
                image: item.image,
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: item.line_total,
            })
            .collect())
    }

    /// Lists orders with pagination, optionally scoped to one shopper
    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        page: u64,
        per_page: u64,
        user_id: Option<Uuid>,
    ) -> Result<OrderListResponse, ServiceError> {
        let mut query = OrderEntity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(user_id) = user_id {
            query = query.filter(order::Column::UserId.eq(user_id));
        }
        let paginator = query.paginate(&*self.db, per_page);

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok(OrderListResponse {
            orders: orders.into_iter().map(Self::model_to_response).collect(),
            total,
            page,
            per_page,
        })
    }

    /// Applies an admin status transition.
    ///
    /// The write is conditioned on the status the admin observed, so a
    /// near-simultaneous reconciler write cannot be silently overwritten.
    /// Entering the fulfillment status commits inventory inside the same
    /// transaction; rewriting the current status is a no-op.
    #[instrument(skip(self, request), fields(order_id = %order_id, new_status = %request.status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        request: UpdateOrderStatusRequest,
    ) -> Result<OrderResponse, ServiceError> {
        let new_status = request.status;
        let now = Utc::now();

        let txn = self.db.begin().await?;

        let order = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let old_status = order.status.clone();

        if old_status == new_status {
            txn.commit().await?;
            return Ok(Self::model_to_response(order));
        }

        if !old_status.can_transition_to(&new_status) {
            txn.rollback().await.ok();
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot transition from status '{}' to '{}'",
                old_status, new_status
            )));
        }

        let updated = OrderEntity::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status.clone()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(old_status.clone()))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            txn.rollback().await.ok();
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        if new_status.triggers_fulfillment() {
            if let Err(err) = self.inventory.commit_in(&txn, order_id).await {
                txn.rollback().await.ok();
                return Err(err);
            }
        }

        txn.commit().await?;

        info!(
            order_id = %order_id,
            old_status = %old_status,
            new_status = %new_status,
            "Order status updated"
        );
        let _ = self
            .event_sender
            .send(Event::OrderStatusChanged {
                order_id,
                old_status: old_status.to_string(),
                new_status: new_status.to_string(),
            })
            .await;

        let refreshed = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        Ok(Self::model_to_response(refreshed))
    }

    pub(crate) fn model_to_response(model: OrderModel) -> OrderResponse {
        OrderResponse {
            id: model.id,
            order_number: model.order_number,
            user_id: model.user_id,
            status: model.status,
            payment_method: model.payment_method,
            total: model.total,
            total_before_discount: model.total_before_discount,
            total_saved: model.total_saved,
            coupon_code: model.coupon_code,
            shipping_address: model.shipping_address,
            is_paid: model.is_paid,
            paid_at: model.paid_at,
            razorpay_order_id: model.razorpay_order_id,
            razorpay_payment_id: model.razorpay_payment_id,
            payment_result: model.payment_result,
            payment_details: model.payment_details,
            refund_details: model.refund_details,
            inventory_committed: model.inventory_committed,
            created_at: model.created_at,
            updated_at: model.updated_at,
            version: model.version,
        }
    }
}
