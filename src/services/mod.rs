// Consistency maintainers (run as hooks inside the mutating transaction)
pub mod order_totals;
pub mod restaurant_rating;

// Write paths
pub mod line_items;
pub mod orders;
pub mod reviews;

// Service factory for dependency injection
pub mod factory;

pub use factory::{ServiceContainer, ServiceFactory};

use prometheus::Registry;

/// Registers the service-level prometheus counters with `registry`.
pub fn register_metrics(registry: &Registry) -> prometheus::Result<()> {
    registry.register(Box::new(orders::ORDER_PLACEMENTS.clone()))?;
    registry.register(Box::new(orders::ORDER_PLACEMENT_FAILURES.clone()))?;
    registry.register(Box::new(line_items::LINE_ITEM_WRITES.clone()))?;
    registry.register(Box::new(line_items::LINE_ITEM_WRITE_FAILURES.clone()))?;
    registry.register(Box::new(reviews::REVIEWS_ADDED.clone()))?;
    registry.register(Box::new(order_totals::ORDER_TOTAL_RECOMPUTATIONS.clone()))?;
    registry.register(Box::new(order_totals::ORDER_TOTAL_DRIFT.clone()))?;
    registry.register(Box::new(
        restaurant_rating::RATING_RECOMPUTATIONS.clone(),
    ))?;
    Ok(())
}
