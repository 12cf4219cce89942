use std::sync::Arc;

use crate::{
    config::OrderPolicy,
    db::{AggregateLocks, DbPool},
    events::EventSender,
    hooks::HookRegistry,
    services::{
        line_items::LineItemService,
        order_totals::{OrderTotalsMaintainer, OrderTotalsService},
        orders::OrderService,
        restaurant_rating::{RestaurantRatingMaintainer, RestaurantRatingService},
        reviews::ReviewService,
    },
};

/// Factory for creating service instances with shared dependencies.
///
/// Every service built by one factory shares the same aggregate locks and
/// hook registry, so writes through any of them are serialized and maintained
/// consistently.
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    policy: OrderPolicy,
    locks: AggregateLocks,
    hooks: Arc<HookRegistry>,
    event_sender: Option<Arc<EventSender>>,
}

impl ServiceFactory {
    /// Creates a factory with the order-totals and restaurant-rating hooks registered.
    pub fn new(db_pool: Arc<DbPool>, policy: OrderPolicy, event_sender: Option<EventSender>) -> Self {
        let hooks = HookRegistry::new()
            .on_line_item(Arc::new(OrderTotalsMaintainer::new(policy.tax_rate)))
            .on_review(Arc::new(RestaurantRatingMaintainer::new()));

        Self {
            db_pool,
            policy,
            locks: AggregateLocks::new(),
            hooks: Arc::new(hooks),
            event_sender: event_sender.map(Arc::new),
        }
    }

    pub fn order_service(&self) -> OrderService {
        OrderService::new(
            self.db_pool.clone(),
            self.locks.clone(),
            self.hooks.clone(),
            self.policy.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn line_item_service(&self) -> LineItemService {
        LineItemService::new(
            self.db_pool.clone(),
            self.locks.clone(),
            self.hooks.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn review_service(&self) -> ReviewService {
        ReviewService::new(
            self.db_pool.clone(),
            self.locks.clone(),
            self.hooks.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn order_totals_service(&self) -> OrderTotalsService {
        OrderTotalsService::new(
            self.db_pool.clone(),
            self.locks.clone(),
            OrderTotalsMaintainer::new(self.policy.tax_rate),
        )
    }

    pub fn restaurant_rating_service(&self) -> RestaurantRatingService {
        RestaurantRatingService::new(self.db_pool.clone(), self.locks.clone())
    }

    /// Gets a reference to the database pool
    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn locks(&self) -> &AggregateLocks {
        &self.locks
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub orders: Arc<OrderService>,
    pub line_items: Arc<LineItemService>,
    pub reviews: Arc<ReviewService>,
    pub order_totals: Arc<OrderTotalsService>,
    pub ratings: Arc<RestaurantRatingService>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            orders: Arc::new(factory.order_service()),
            line_items: Arc::new(factory.line_item_service()),
            reviews: Arc::new(factory.review_service()),
            order_totals: Arc::new(factory.order_totals_service()),
            ratings: Arc::new(factory.restaurant_rating_service()),
        }
    }
}
