use crate::{
    db::{transaction, AggregateKey, AggregateLocks, DbPool},
    entities::{menu, menu_item, order, order_item},
    errors::ServiceError,
    events::{Event, EventSender},
    hooks::{HookRegistry, LineItemChange, LineItemMutation},
    pricing::{line_total, OrderTotals},
};
use lazy_static::lazy_static;
use prometheus::IntCounter;
use sea_orm::{
    ColumnTrait, DatabaseTransaction, EntityTrait, ModelTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;

lazy_static! {
    pub(crate) static ref LINE_ITEM_WRITES: IntCounter = IntCounter::new(
        "line_item_writes_total",
        "Total number of committed line item inserts and deletes"
    )
    .expect("metric can be created");
    pub(crate) static ref LINE_ITEM_WRITE_FAILURES: IntCounter = IntCounter::new(
        "line_item_write_failures_total",
        "Total number of failed line item inserts and deletes"
    )
    .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddLineItemRequest {
    pub order_id: i32,
    pub menu_item_id: i32,
    #[validate(range(min = 1, message = "Quantity must be positive"))]
    pub quantity: i32,
}

/// A committed line-item write and the order totals it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineItemWrite {
    pub item: order_item::Model,
    pub totals: OrderTotals,
}

/// Inserts one line item priced from `menu_item` and runs the line-item hooks.
///
/// The caller owns the transaction and has already checked that the order
/// exists. A second row for the same `(order, menu item)` pair is rejected.
pub(crate) async fn insert_in_txn(
    txn: &DatabaseTransaction,
    hooks: &HookRegistry,
    order_id: i32,
    menu_item: &menu_item::Model,
    quantity: i32,
) -> Result<order_item::Model, ServiceError> {
    if quantity <= 0 {
        return Err(ServiceError::ConstraintViolationError(format!(
            "quantity must be positive, got {}",
            quantity
        )));
    }

    let existing = order_item::Entity::find_by_id((order_id, menu_item.id))
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?;
    if existing.is_some() {
        return Err(ServiceError::ConstraintViolationError(format!(
            "order {} already has a line for menu item {}",
            order_id, menu_item.id
        )));
    }

    let item = order_item::Model {
        order_id,
        menu_item_id: menu_item.id,
        quantity,
        unit_price: menu_item.price,
        line_total: line_total(menu_item.price, quantity),
    };

    order_item::Entity::insert(order_item::ActiveModel {
        order_id: Set(item.order_id),
        menu_item_id: Set(item.menu_item_id),
        quantity: Set(item.quantity),
        unit_price: Set(item.unit_price),
        line_total: Set(item.line_total),
    })
    .exec_without_returning(txn)
    .await
    .map_err(ServiceError::db_error)?;

    hooks
        .run_line_item(
            txn,
            &LineItemMutation {
                order_id,
                menu_item_id: menu_item.id,
                change: LineItemChange::Inserted,
            },
        )
        .await?;

    Ok(item)
}

async fn load_order(txn: &DatabaseTransaction, order_id: i32) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| ServiceError::InvalidReferenceError(format!("order {} does not exist", order_id)))
}

/// Line-item writes. Every write runs the registered hooks in the same
/// transaction, so order totals are current when the write commits.
#[derive(Clone)]
pub struct LineItemService {
    db_pool: Arc<DbPool>,
    locks: AggregateLocks,
    hooks: Arc<HookRegistry>,
    event_sender: Option<Arc<EventSender>>,
}

impl LineItemService {
    pub fn new(
        db_pool: Arc<DbPool>,
        locks: AggregateLocks,
        hooks: Arc<HookRegistry>,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        Self {
            db_pool,
            locks,
            hooks,
            event_sender,
        }
    }

    #[instrument(skip(self, request), fields(order_id = request.order_id, menu_item_id = request.menu_item_id))]
    pub async fn insert_line_item(
        &self,
        request: AddLineItemRequest,
    ) -> Result<LineItemWrite, ServiceError> {
        request.validate()?;

        let _guard = self.locks.acquire(AggregateKey::Order(request.order_id)).await;
        let tx = transaction::begin(&self.db_pool, "insert_line_item").await?;

        let result = async {
            let order = load_order(tx.conn(), request.order_id).await?;
            let menu_item = menu_item::Entity::find_by_id(request.menu_item_id)
                .inner_join(menu::Entity)
                .filter(menu::Column::RestaurantId.eq(order.restaurant_id))
                .one(tx.conn())
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::InvalidReferenceError(format!(
                        "menu item {} is not on restaurant {}'s menu",
                        request.menu_item_id, order.restaurant_id
                    ))
                })?;

            let item = insert_in_txn(
                tx.conn(),
                &self.hooks,
                request.order_id,
                &menu_item,
                request.quantity,
            )
            .await?;
            let order = load_order(tx.conn(), request.order_id).await?;
            Ok::<_, ServiceError>(LineItemWrite {
                item,
                totals: OrderTotals::of(&order),
            })
        }
        .await;

        let write = transaction::settle(tx, result).await.map_err(|e| {
            LINE_ITEM_WRITE_FAILURES.inc();
            error!(error = %e, "Failed to insert line item");
            e
        })?;

        LINE_ITEM_WRITES.inc();
        info!(total = %write.totals.total, "Line item added");

        self.publish(Event::LineItemAdded {
            order_id: write.item.order_id,
            menu_item_id: write.item.menu_item_id,
            quantity: write.item.quantity,
        })
        .await;
        self.publish(Event::OrderTotalsRecomputed {
            order_id: write.item.order_id,
            totals: write.totals,
        })
        .await;

        Ok(write)
    }

    /// Removes one line item. Returns the order's totals after the removal.
    #[instrument(skip(self))]
    pub async fn delete_line_item(
        &self,
        order_id: i32,
        menu_item_id: i32,
    ) -> Result<OrderTotals, ServiceError> {
        let _guard = self.locks.acquire(AggregateKey::Order(order_id)).await;
        let tx = transaction::begin(&self.db_pool, "delete_line_item").await?;

        let result = async {
            let item = order_item::Entity::find_by_id((order_id, menu_item_id))
                .one(tx.conn())
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!(
                        "order {} has no line for menu item {}",
                        order_id, menu_item_id
                    ))
                })?;
            item.delete(tx.conn()).await.map_err(ServiceError::db_error)?;

            self.hooks
                .run_line_item(
                    tx.conn(),
                    &LineItemMutation {
                        order_id,
                        menu_item_id,
                        change: LineItemChange::Deleted,
                    },
                )
                .await?;

            let order = load_order(tx.conn(), order_id).await?;
            Ok::<_, ServiceError>(OrderTotals::of(&order))
        }
        .await;

        let totals = transaction::settle(tx, result).await.map_err(|e| {
            LINE_ITEM_WRITE_FAILURES.inc();
            error!(error = %e, "Failed to delete line item");
            e
        })?;

        LINE_ITEM_WRITES.inc();
        info!(total = %totals.total, "Line item removed");

        self.publish(Event::LineItemRemoved {
            order_id,
            menu_item_id,
        })
        .await;
        self.publish(Event::OrderTotalsRecomputed { order_id, totals })
            .await;

        Ok(totals)
    }

    /// Line items of an order, ordered by menu item id.
    pub async fn list_line_items(&self, order_id: i32) -> Result<Vec<order_item::Model>, ServiceError> {
        order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::MenuItemId)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send line item event");
            }
        }
    }
}
