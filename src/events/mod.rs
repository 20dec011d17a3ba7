use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events emitted by the order, coupon, payment and inventory services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Order lifecycle
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment reconciliation
    OrderPaid {
        order_id: Uuid,
        payment_id: String,
    },
    OrderPaymentFailed {
        order_id: Uuid,
        payment_id: String,
        reason: Option<String>,
    },
    OrderRefunded {
        order_id: Uuid,
        refund_id: String,
    },

    // Coupon ledger
    CouponRedeemed {
        coupon_id: Uuid,
        user_id: Uuid,
        code: String,
    },

    // Inventory adjustment
    InventoryCommitted {
        order_id: Uuid,
        lines_adjusted: u32,
        lines_skipped: u32,
    },
    OversellDetected {
        order_id: Uuid,
        product_id: Uuid,
        size_label: String,
        requested: i32,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Drains the event channel, logging each event. Runs for the lifetime of
/// the server task that spawned it.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    info!("Event processor started");
    while let Some(event) = receiver.recv().await {
        match &event {
            Event::OversellDetected {
                order_id,
                product_id,
                size_label,
                requested,
            } => {
                warn!(
                    order_id = %order_id,
                    product_id = %product_id,
                    size = %size_label,
                    requested = requested,
                    "Oversell detected while committing inventory"
                );
            }
            other => {
                info!(event = ?other, "Event processed");
            }
        }
    }
    info!("Event processor stopped");
}
