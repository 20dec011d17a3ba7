pub mod common;
pub mod coupons;
pub mod orders;
pub mod payment_webhooks;
pub mod payments;
pub mod products;

use std::sync::Arc;

use crate::db::DbPool;
use crate::events::EventSender;
use crate::gateway::PaymentGateway;
use crate::services::notifications::NotificationGateway;
use crate::services::payments::PaymentCredentials;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer that encapsulates business logic used by HTTP handlers
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<crate::services::catalog::CatalogService>,
    pub coupons: Arc<crate::services::coupons::CouponService>,
    pub orders: Arc<crate::services::orders::OrderService>,
    pub inventory: Arc<crate::services::inventory::InventoryService>,
    pub payments: Arc<crate::services::payments::PaymentService>,
}

impl AppServices {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: EventSender,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn NotificationGateway>,
        credentials: PaymentCredentials,
    ) -> Self {
        let catalog = Arc::new(crate::services::catalog::CatalogService::new(
            db_pool.clone(),
        ));
        let coupons = Arc::new(crate::services::coupons::CouponService::new(
            db_pool.clone(),
            event_sender.clone(),
        ));
        let inventory = Arc::new(crate::services::inventory::InventoryService::new(
            db_pool.clone(),
            event_sender.clone(),
        ));
        let orders = Arc::new(crate::services::orders::OrderService::new(
            db_pool.clone(),
            event_sender.clone(),
            coupons.clone(),
            inventory.clone(),
            notifier.clone(),
        ));
        let payments = Arc::new(crate::services::payments::PaymentService::new(
            db_pool,
            event_sender,
            orders.clone(),
            inventory.clone(),
            notifier,
            gateway,
            credentials,
        ));

        Self {
            catalog,
            coupons,
            orders,
            inventory,
            payments,
        }
    }
}
