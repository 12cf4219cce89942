use crate::{
    config::{OrderPolicy, UnknownItemPolicy},
    db::{transaction, AggregateKey, AggregateLocks, DbPool},
    entities::{address, customer, menu, menu_item, order, payment, restaurant, OrderStatus, PaymentStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    hooks::HookRegistry,
    services::{line_items, order_totals::OrderTotalsMaintainer},
};
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::{Validate, ValidationError};

lazy_static! {
    pub(crate) static ref ORDER_PLACEMENTS: IntCounter =
        IntCounter::new("order_placements_total", "Total number of orders placed")
            .expect("metric can be created");
    pub(crate) static ref ORDER_PLACEMENT_FAILURES: IntCounter = IntCounter::new(
        "order_placement_failures_total",
        "Total number of failed order placements"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItemRequest {
    pub menu_item_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PlaceOrderRequest {
    pub customer_id: i32,
    pub restaurant_id: i32,
    pub address_id: i32,
    /// An empty list is accepted here and rejected as an empty order.
    #[validate(custom = "validate_quantities")]
    pub items: Vec<OrderItemRequest>,
}

fn validate_quantities(items: &[OrderItemRequest]) -> Result<(), ValidationError> {
    if items.iter().any(|item| item.quantity < 1) {
        let mut err = ValidationError::new("quantity");
        err.message = Some("Every quantity must be at least 1".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrderResult {
    pub order_id: i32,
    pub payment_id: i32,
    pub subtotal: Decimal,
    pub tax: Decimal,
    pub delivery_fee: Decimal,
    pub total: Decimal,
    /// Requested ids that did not resolve, when the skip policy is active.
    pub skipped_item_ids: Vec<i32>,
}

/// Sums quantities of repeated menu item ids, keeping first-seen order.
fn merge_items(items: &[OrderItemRequest]) -> Result<Vec<(i32, i32)>, ServiceError> {
    let mut merged: Vec<(i32, i32)> = Vec::with_capacity(items.len());
    let mut positions: HashMap<i32, usize> = HashMap::new();

    for item in items {
        match positions.get(&item.menu_item_id) {
            Some(&idx) => {
                let quantity = merged[idx].1.checked_add(item.quantity).ok_or_else(|| {
                    ServiceError::ConstraintViolationError(format!(
                        "quantity for menu item {} overflows",
                        item.menu_item_id
                    ))
                })?;
                merged[idx].1 = quantity;
            }
            None => {
                positions.insert(item.menu_item_id, merged.len());
                merged.push((item.menu_item_id, item.quantity));
            }
        }
    }

    Ok(merged)
}

#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    locks: AggregateLocks,
    hooks: Arc<HookRegistry>,
    policy: OrderPolicy,
    totals: OrderTotalsMaintainer,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderService {
    /// `hooks` must carry the order-totals hook; placement cross-checks its result.
    pub fn new(
        db_pool: Arc<DbPool>,
        locks: AggregateLocks,
        hooks: Arc<HookRegistry>,
        policy: OrderPolicy,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let totals = OrderTotalsMaintainer::new(policy.tax_rate);
        Self {
            db_pool,
            locks,
            hooks,
            policy,
            totals,
            event_sender,
        }
    }

    /// Places an order with its line items and a pending payment, atomically.
    #[instrument(skip(self, request), fields(customer_id = request.customer_id, restaurant_id = request.restaurant_id))]
    pub async fn place_order(
        &self,
        request: PlaceOrderRequest,
    ) -> Result<PlaceOrderResult, ServiceError> {
        if let Err(e) = request.validate() {
            ORDER_PLACEMENT_FAILURES.inc();
            return Err(e.into());
        }

        let tx = transaction::begin(&self.db_pool, "place_order").await?;
        let result = self.place_in_txn(tx.conn(), &request).await;
        let placed = transaction::settle(tx, result).await.map_err(|e| {
            ORDER_PLACEMENT_FAILURES.inc();
            error!(error = %e, code = e.code(), "Order placement failed");
            e
        })?;

        ORDER_PLACEMENTS.inc();
        info!(
            order_id = placed.order_id,
            payment_id = placed.payment_id,
            total = %placed.total,
            "Order placed"
        );

        if let Some(sender) = &self.event_sender {
            let event = Event::OrderPlaced {
                order_id: placed.order_id,
                payment_id: placed.payment_id,
                total: placed.total,
            };
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send OrderPlaced event");
            }
        }

        Ok(placed)
    }

    async fn place_in_txn(
        &self,
        txn: &DatabaseTransaction,
        request: &PlaceOrderRequest,
    ) -> Result<PlaceOrderResult, ServiceError> {
        self.check_references(txn, request).await?;

        let now = Utc::now();
        let order = order::ActiveModel {
            customer_id: Set(request.customer_id),
            restaurant_id: Set(request.restaurant_id),
            address_id: Set(request.address_id),
            placed_at: Set(now),
            status: Set(OrderStatus::Placed),
            subtotal: Set(Decimal::ZERO),
            tax: Set(Decimal::ZERO),
            delivery_fee: Set(self.policy.delivery_fee),
            total: Set(Decimal::ZERO),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(txn)
        .await
        .map_err(ServiceError::db_error)?;

        let requested = merge_items(&request.items)?;
        let ids: Vec<i32> = requested.iter().map(|(id, _)| *id).collect();
        // Items on another restaurant's menu resolve like unknown ids.
        let menu_items: HashMap<i32, menu_item::Model> = menu_item::Entity::find()
            .inner_join(menu::Entity)
            .filter(menu_item::Column::Id.is_in(ids))
            .filter(menu::Column::RestaurantId.eq(request.restaurant_id))
            .all(txn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|item| (item.id, item))
            .collect();

        let skipped_item_ids: Vec<i32> = requested
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !menu_items.contains_key(id))
            .collect();

        if !skipped_item_ids.is_empty() {
            match self.policy.unknown_item_policy {
                UnknownItemPolicy::Reject => {
                    return Err(ServiceError::InvalidReferenceError(format!(
                        "menu items {:?} are not on restaurant {}'s menu",
                        skipped_item_ids, request.restaurant_id
                    )));
                }
                UnknownItemPolicy::Skip => {
                    warn!(order_id = order.id, skipped = ?skipped_item_ids, "Skipping unknown menu items");
                }
            }
        }

        let resolved: Vec<(&menu_item::Model, i32)> = requested
            .iter()
            .filter_map(|(id, qty)| menu_items.get(id).map(|item| (item, *qty)))
            .collect();
        if resolved.is_empty() {
            return Err(ServiceError::EmptyOrderError(format!(
                "order {} has no resolvable items",
                order.id
            )));
        }

        for (item, quantity) in resolved {
            line_items::insert_in_txn(txn, &self.hooks, order.id, item, quantity).await?;
        }

        let safeguard = self.totals.recompute(txn, order.id).await?;
        if safeguard.changed {
            error!(order_id = order.id, "Order totals hook disagreed with direct recomputation");
            return Err(ServiceError::InternalError(format!(
                "order {} totals diverged between hook and recomputation",
                order.id
            )));
        }
        let totals = safeguard.totals;

        let payment = payment::ActiveModel {
            order_id: Set(order.id),
            amount: Set(totals.total),
            method: Set(self.policy.default_payment_method.clone()),
            status: Set(PaymentStatus::Pending),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(txn)
        .await
        .map_err(ServiceError::db_error)?;

        Ok(PlaceOrderResult {
            order_id: order.id,
            payment_id: payment.id,
            subtotal: totals.subtotal,
            tax: totals.tax,
            delivery_fee: order.delivery_fee,
            total: totals.total,
            skipped_item_ids,
        })
    }

    async fn check_references(
        &self,
        txn: &DatabaseTransaction,
        request: &PlaceOrderRequest,
    ) -> Result<(), ServiceError> {
        if customer::Entity::find_by_id(request.customer_id)
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?
            .is_none()
        {
            return Err(ServiceError::InvalidReferenceError(format!(
                "customer {} does not exist",
                request.customer_id
            )));
        }

        if restaurant::Entity::find_by_id(request.restaurant_id)
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?
            .is_none()
        {
            return Err(ServiceError::InvalidReferenceError(format!(
                "restaurant {} does not exist",
                request.restaurant_id
            )));
        }

        let address = address::Entity::find_by_id(request.address_id)
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::InvalidReferenceError(format!(
                    "address {} does not exist",
                    request.address_id
                ))
            })?;
        if address.customer_id != request.customer_id {
            return Err(ServiceError::InvalidReferenceError(format!(
                "address {} does not belong to customer {}",
                request.address_id, request.customer_id
            )));
        }

        Ok(())
    }

    pub async fn get_order(&self, order_id: i32) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))
    }

    pub async fn get_payment(&self, order_id: i32) -> Result<payment::Model, ServiceError> {
        payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("payment for order {} not found", order_id))
            })
    }

    /// Moves an order along its lifecycle; illegal transitions fail with `InvalidStatus`.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        order_id: i32,
        new_status: OrderStatus,
    ) -> Result<order::Model, ServiceError> {
        let _guard = self.locks.acquire(AggregateKey::Order(order_id)).await;
        let tx = transaction::begin(&self.db_pool, "update_order_status").await?;

        let result = async {
            let order = order::Entity::find_by_id(order_id)
                .one(tx.conn())
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;

            let old_status = order.status;
            if !old_status.can_transition_to(new_status) {
                return Err(ServiceError::InvalidStatus(format!(
                    "order {} cannot move from {} to {}",
                    order_id, old_status, new_status
                )));
            }

            let mut active: order::ActiveModel = order.into();
            active.status = Set(new_status);
            active.updated_at = Set(Utc::now());
            let updated = active
                .update(tx.conn())
                .await
                .map_err(ServiceError::db_error)?;
            Ok::<_, ServiceError>((old_status, updated))
        }
        .await;

        let (old_status, updated) = transaction::settle(tx, result).await?;
        info!(order_id, from = %old_status, to = %new_status, "Order status updated");

        if let Some(sender) = &self.event_sender {
            let event = Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
            };
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send OrderStatusChanged event");
            }
        }

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn item(menu_item_id: i32, quantity: i32) -> OrderItemRequest {
        OrderItemRequest {
            menu_item_id,
            quantity,
        }
    }

    #[test]
    fn merges_repeated_items_in_first_seen_order() {
        let merged = merge_items(&[item(7, 1), item(3, 2), item(7, 4)]).unwrap();
        assert_eq!(merged, vec![(7, 5), (3, 2)]);
    }

    #[test]
    fn merge_rejects_quantity_overflow() {
        let result = merge_items(&[item(1, i32::MAX), item(1, 1)]);
        assert_matches!(result, Err(ServiceError::ConstraintViolationError(_)));
    }

    #[test]
    fn validation_checks_quantities_only() {
        // An empty list passes here; placement reports it as an empty order.
        let mut request = PlaceOrderRequest {
            customer_id: 1,
            restaurant_id: 1,
            address_id: 1,
            items: vec![],
        };
        assert!(request.validate().is_ok());

        request.items = vec![item(1, 0)];
        assert!(request.validate().is_err());

        request.items = vec![item(1, 1), item(1, 3)];
        assert!(request.validate().is_ok());
    }
}
