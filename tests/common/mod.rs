#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use delivery_core::{
    config::{AppConfig, OrderPolicy},
    db::{self, AggregateLocks, DbPool},
    entities::{address, customer, menu, menu_item, restaurant},
    events::{self, Event},
    services::orders::{OrderItemRequest, PlaceOrderRequest},
    ServiceContainer, ServiceFactory,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const CUSTOMER_ID: i32 = 1;
pub const OTHER_CUSTOMER_ID: i32 = 2;
pub const ADDRESS_ID: i32 = 10;
pub const OTHER_ADDRESS_ID: i32 = 11;
pub const RESTAURANT_ID: i32 = 100;
pub const QUIET_RESTAURANT_ID: i32 = 101;
pub const MENU_ID: i32 = 200;
pub const QUIET_MENU_ID: i32 = 201;

/// Menu items seeded for `RESTAURANT_ID`.
pub const PASTA: (i32, Decimal) = (4010, dec!(8.50));
pub const SALAD: (i32, Decimal) = (4011, dec!(5.00));
pub const SODA: (i32, Decimal) = (4012, dec!(1.99));
/// Only on `QUIET_RESTAURANT_ID`'s menu.
pub const NOODLES: (i32, Decimal) = (4020, dec!(9.00));

/// Harness over a freshly migrated and seeded SQLite database.
pub struct TestApp {
    pub db: Arc<DbPool>,
    pub services: ServiceContainer,
    pub locks: AggregateLocks,
    pub events: mpsc::Receiver<Event>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_policy(OrderPolicy::default()).await
    }

    /// In-memory database behind a single connection, so every service sees
    /// the same data and transactions never overlap.
    pub async fn with_policy(policy: OrderPolicy) -> Self {
        let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.orders = policy;
        Self::with_config(cfg).await
    }

    /// File database in `dir` behind several connections, so transactions on
    /// different tasks really run at the same time.
    pub async fn on_file(dir: &TempDir) -> Self {
        let path = dir.path().join("delivery.db");
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let mut cfg = AppConfig::new(url, "test".to_string());
        cfg.db_max_connections = 4;
        cfg.db_min_connections = 1;
        Self::with_config(cfg).await
    }

    pub async fn with_config(mut cfg: AppConfig) -> Self {
        cfg.auto_migrate = true;

        let pool = db::prepare_database(&cfg).await.expect("db setup");
        seed(&pool).await;

        let db = Arc::new(pool);
        let (sender, events) = events::channel(cfg.event_channel_capacity);
        let factory = ServiceFactory::new(db.clone(), cfg.orders.clone(), Some(sender));

        Self {
            db,
            services: ServiceContainer::new(&factory),
            locks: factory.locks().clone(),
            events,
        }
    }

    /// Events published so far, without waiting.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Places an order for the default customer at the default restaurant.
    pub async fn place(&self, items: &[(i32, i32)]) -> delivery_core::services::orders::PlaceOrderResult {
        self.services
            .orders
            .place_order(order_request(items))
            .await
            .expect("place order")
    }
}

pub fn order_request(items: &[(i32, i32)]) -> PlaceOrderRequest {
    PlaceOrderRequest {
        customer_id: CUSTOMER_ID,
        restaurant_id: RESTAURANT_ID,
        address_id: ADDRESS_ID,
        items: items
            .iter()
            .map(|&(menu_item_id, quantity)| OrderItemRequest {
                menu_item_id,
                quantity,
            })
            .collect(),
    }
}

async fn seed(db: &DbPool) {
    let now = Utc::now();

    for (id, name) in [(CUSTOMER_ID, "Ada"), (OTHER_CUSTOMER_ID, "Grace")] {
        customer::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            email: Set(format!("{}@example.com", name.to_lowercase())),
            phone: Set(None),
            created_at: Set(now),
        }
        .insert(db)
        .await
        .expect("seed customer");
    }

    for (id, customer_id) in [(ADDRESS_ID, CUSTOMER_ID), (OTHER_ADDRESS_ID, OTHER_CUSTOMER_ID)] {
        address::ActiveModel {
            id: Set(id),
            customer_id: Set(customer_id),
            line1: Set("1 Main St".to_string()),
            city: Set("Toronto".to_string()),
            postal_code: Set("M5V 1A1".to_string()),
        }
        .insert(db)
        .await
        .expect("seed address");
    }

    for (id, name) in [(RESTAURANT_ID, "Trattoria"), (QUIET_RESTAURANT_ID, "Noodle Bar")] {
        restaurant::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            cuisine: Set(None),
            rating_avg: Set(None),
        }
        .insert(db)
        .await
        .expect("seed restaurant");
    }

    for (id, restaurant_id) in [(MENU_ID, RESTAURANT_ID), (QUIET_MENU_ID, QUIET_RESTAURANT_ID)] {
        menu::ActiveModel {
            id: Set(id),
            restaurant_id: Set(restaurant_id),
            name: Set("Dinner".to_string()),
        }
        .insert(db)
        .await
        .expect("seed menu");
    }

    for (id, menu_id, name, price) in [
        (PASTA.0, MENU_ID, "Pasta", PASTA.1),
        (SALAD.0, MENU_ID, "Salad", SALAD.1),
        (SODA.0, MENU_ID, "Soda", SODA.1),
        (NOODLES.0, QUIET_MENU_ID, "Noodles", NOODLES.1),
    ] {
        menu_item::ActiveModel {
            id: Set(id),
            menu_id: Set(menu_id),
            name: Set(name.to_string()),
            price: Set(price),
            is_available: Set(true),
        }
        .insert(db)
        .await
        .expect("seed menu item");
    }
}
