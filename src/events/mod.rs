use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::entities::OrderStatus;
use crate::pricing::OrderTotals;

/// Domain events published after a write commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderPlaced {
        order_id: i32,
        payment_id: i32,
        total: Decimal,
    },
    OrderStatusChanged {
        order_id: i32,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    LineItemAdded {
        order_id: i32,
        menu_item_id: i32,
        quantity: i32,
    },
    LineItemRemoved {
        order_id: i32,
        menu_item_id: i32,
    },
    OrderTotalsRecomputed {
        order_id: i32,
        totals: OrderTotals,
    },
    ReviewAdded {
        review_id: i32,
        restaurant_id: i32,
        rating: i32,
    },
    RestaurantRatingUpdated {
        restaurant_id: i32,
        rating_avg: Option<Decimal>,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderPlaced { .. } => "order_placed",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::LineItemAdded { .. } => "line_item_added",
            Event::LineItemRemoved { .. } => "line_item_removed",
            Event::OrderTotalsRecomputed { .. } => "order_totals_recomputed",
            Event::ReviewAdded { .. } => "review_added",
            Event::RestaurantRatingUpdated { .. } => "restaurant_rating_updated",
        }
    }
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

/// Creates a bounded event channel.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Drains the channel, logging each event. Returns when every sender is gone.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderPlaced {
                order_id, total, ..
            } => {
                info!(order_id, total = %total, "Order placed");
            }
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(order_id, from = %old_status, to = %new_status, "Order status changed");
            }
            Event::RestaurantRatingUpdated {
                restaurant_id,
                rating_avg,
            } => {
                info!(restaurant_id, rating_avg = ?rating_avg, "Restaurant rating updated");
            }
            other => match serde_json::to_string(other) {
                Ok(payload) => debug!(event = other.name(), %payload, "Event received"),
                Err(e) => warn!(event = other.name(), error = %e, "Failed to serialize event"),
            },
        }
    }

    info!("Event channel closed; processor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sender_delivers_in_order() {
        let (sender, mut rx) = channel(4);
        sender
            .send(Event::LineItemRemoved {
                order_id: 1,
                menu_item_id: 2,
            })
            .await
            .unwrap();
        sender
            .send(Event::ReviewAdded {
                review_id: 9,
                restaurant_id: 3,
                rating: 5,
            })
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "line_item_removed");
        assert_eq!(rx.recv().await.unwrap().name(), "review_added");
    }

    #[test]
    fn events_serialize_with_variant_tag() {
        let event = Event::OrderTotalsRecomputed {
            order_id: 5,
            totals: OrderTotals::empty(rust_decimal_macros::dec!(3.99)),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["OrderTotalsRecomputed"]["order_id"], 5);
        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_dropped() {
        let (sender, rx) = channel(1);
        drop(rx);
        let result = sender
            .send(Event::LineItemRemoved {
                order_id: 1,
                menu_item_id: 1,
            })
            .await;
        assert!(result.is_err());
    }
}
