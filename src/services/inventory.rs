use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    TransactionTrait,
};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{
    entities::{
        order::{self, Entity as OrderEntity},
        order_item::{self, Entity as OrderItemEntity},
        product::{self, Entity as ProductEntity},
        product_size::{self, Entity as ProductSizeEntity},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};

/// Result of an inventory commit attempt for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryCommit {
    /// Stock was decremented now, exactly once.
    Committed {
        lines_adjusted: u32,
        lines_skipped: u32,
    },
    /// A previous invocation already adjusted this order; nothing to do.
    AlreadyCommitted,
}

/// Decrements per-size stock and advances sold counters exactly once per
/// order, gated on the order's `inventory_committed` flag rather than its
/// status value, so repeated status writes stay idempotent.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Commits inventory for an order in its own transaction. Oversell rolls
    /// the whole commit back, flag included, and surfaces
    /// `InsufficientStock`.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn commit_for_order(&self, order_id: Uuid) -> Result<InventoryCommit, ServiceError> {
        let txn = self.db.begin().await?;
        let outcome = match self.commit_in(&txn, order_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                txn.rollback().await.ok();
                return Err(err);
            }
        };
        txn.commit().await?;

        if let InventoryCommit::Committed {
            lines_adjusted,
            lines_skipped,
        } = outcome
        {
            counter!("storefront_inventory_commits_total", 1);
            let _ = self
                .event_sender
                .send(Event::InventoryCommitted {
                    order_id,
                    lines_adjusted,
                    lines_skipped,
                })
                .await;
        }

        Ok(outcome)
    }

    /// Commits inventory against a caller-owned transaction.
    ///
    /// The flag flip is the exactly-once gate: it is applied with
    /// `inventory_committed = false` as a write predicate, so of any number
    /// of concurrent or repeated invocations only one proceeds to the
    /// decrements. Everything here must roll back together, which is why the
    /// caller owns the transaction.
    pub async fn commit_in<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
    ) -> Result<InventoryCommit, ServiceError> {
        let gate = OrderEntity::update_many()
            .col_expr(order::Column::InventoryCommitted, Expr::value(true))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::InventoryCommitted.eq(false))
            .exec(conn)
            .await?;

        if gate.rows_affected == 0 {
            let exists = OrderEntity::find_by_id(order_id).one(conn).await?.is_some();
            if !exists {
                return Err(ServiceError::NotFound(format!(
                    "Order {} not found",
                    order_id
                )));
            }
            debug!(order_id = %order_id, "Inventory already committed; skipping");
            return Ok(InventoryCommit::AlreadyCommitted);
        }

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(conn)
            .await?;

        let mut lines_adjusted = 0u32;
        let mut lines_skipped = 0u32;

        for item in items {
            let Some(product) = ProductEntity::find_by_id(item.product_id).one(conn).await?
            else {
                warn!(
                    order_id = %order_id,
                    product_id = %item.product_id,
                    "Product no longer exists; skipping line item"
                );
                lines_skipped += 1;
                continue;
            };

            let size = ProductSizeEntity::find()
                .filter(product_size::Column::ProductId.eq(product.id))
                .filter(product_size::Column::Label.eq(item.size_label.clone()))
                .one(conn)
                .await?;
            let Some(size) = size else {
                warn!(
                    order_id = %order_id,
                    product_id = %product.id,
                    size = %item.size_label,
                    "Size variant no longer exists; skipping line item"
                );
                lines_skipped += 1;
                continue;
            };

            // Conditional decrement: qty >= ordered is the write
            // precondition, so a lost race for the last units is an explicit
            // oversell rejection rather than a negative quantity.
            let decremented = ProductSizeEntity::update_many()
                .col_expr(
                    product_size::Column::Qty,
                    Expr::col(product_size::Column::Qty).sub(item.quantity),
                )
                .col_expr(
                    product_size::Column::Sold,
                    Expr::col(product_size::Column::Sold).add(item.quantity),
                )
                .filter(product_size::Column::Id.eq(size.id))
                .filter(product_size::Column::Qty.gte(item.quantity))
                .exec(conn)
                .await?;

            if decremented.rows_affected == 0 {
                counter!("storefront_inventory_oversell_total", 1);
                let _ = self
                    .event_sender
                    .send(Event::OversellDetected {
                        order_id,
                        product_id: product.id,
                        size_label: item.size_label.clone(),
                        requested: item.quantity,
                    })
                    .await;
                return Err(ServiceError::InsufficientStock(format!(
                    "size '{}' of product {} has fewer than {} units available",
                    item.size_label, product.id, item.quantity
                )));
            }

            ProductEntity::update_many()
                .col_expr(
                    product::Column::Sold,
                    Expr::col(product::Column::Sold).add(item.quantity),
                )
                .filter(product::Column::Id.eq(product.id))
                .exec(conn)
                .await?;

            lines_adjusted += 1;
        }

        info!(
            order_id = %order_id,
            lines_adjusted = lines_adjusted,
            lines_skipped = lines_skipped,
            "Inventory committed for order"
        );

        Ok(InventoryCommit::Committed {
            lines_adjusted,
            lines_skipped,
        })
    }
}
