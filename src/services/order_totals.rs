use crate::{
    db::{transaction, AggregateKey, AggregateLocks, DbPool},
    entities::{order, order_item},
    errors::ServiceError,
    hooks::{LineItemMutation, MutationHook},
    pricing::OrderTotals,
};
use async_trait::async_trait;
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    QueryFilter, QuerySelect, Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

lazy_static! {
    pub(crate) static ref ORDER_TOTAL_RECOMPUTATIONS: IntCounter = IntCounter::new(
        "order_total_recomputations_total",
        "Number of order total recomputations that changed stored values"
    )
    .expect("metric can be created");
    pub(crate) static ref ORDER_TOTAL_DRIFT: IntCounter = IntCounter::new(
        "order_total_drift_total",
        "Number of orders found with stale totals during reconciliation"
    )
    .expect("metric can be created");
}

/// Outcome of a recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recomputation {
    pub totals: OrderTotals,
    /// False when the stored values already matched and nothing was written.
    pub changed: bool,
}

/// Keeps `orders.subtotal`, `tax` and `total` equal to what the order's line
/// items imply. Registered as a line-item hook.
#[derive(Debug, Clone, Copy)]
pub struct OrderTotalsMaintainer {
    tax_rate: Decimal,
}

impl OrderTotalsMaintainer {
    pub fn new(tax_rate: Decimal) -> Self {
        Self { tax_rate }
    }

    pub fn tax_rate(&self) -> Decimal {
        self.tax_rate
    }

    /// Computes the totals `order` should carry without writing anything.
    pub async fn expected<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: &order::Model,
    ) -> Result<OrderTotals, ServiceError> {
        let lines = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(OrderTotals::compute(
            lines.into_iter().map(|line| line.line_total),
            order.delivery_fee,
            self.tax_rate,
        ))
    }

    /// Recomputes and stores the totals of `order_id` inside the caller's transaction.
    ///
    /// The order row is locked for the rest of the transaction. Fails with
    /// `ReferentialIntegrityError` when the order does not exist.
    pub async fn recompute<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: i32,
    ) -> Result<Recomputation, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                error!(order_id, "Line item mutation for an order that does not exist");
                ServiceError::ReferentialIntegrityError(format!(
                    "order {} does not exist",
                    order_id
                ))
            })?;

        let totals = self.expected(conn, &order).await?;
        if totals.total.is_sign_negative() && !totals.total.is_zero() {
            return Err(ServiceError::ConstraintViolationError(format!(
                "order {} total would be negative ({})",
                order_id, totals.total
            )));
        }

        if totals.matches(&order) {
            debug!(order_id, "Order totals already current");
            return Ok(Recomputation {
                totals,
                changed: false,
            });
        }

        let mut active: order::ActiveModel = order.into();
        active.subtotal = Set(totals.subtotal);
        active.tax = Set(totals.tax);
        active.total = Set(totals.total);
        active.updated_at = Set(Utc::now());
        active.update(conn).await.map_err(ServiceError::db_error)?;

        ORDER_TOTAL_RECOMPUTATIONS.inc();
        debug!(
            order_id,
            subtotal = %totals.subtotal,
            tax = %totals.tax,
            total = %totals.total,
            "Order totals recomputed"
        );

        Ok(Recomputation {
            totals,
            changed: true,
        })
    }
}

#[async_trait]
impl MutationHook<LineItemMutation> for OrderTotalsMaintainer {
    fn name(&self) -> &'static str {
        "order_totals"
    }

    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        mutation: &LineItemMutation,
    ) -> Result<(), ServiceError> {
        self.recompute(txn, mutation.order_id).await.map(|_| ())
    }
}

/// Stored versus expected totals of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TotalsReport {
    pub order_id: i32,
    pub stored: OrderTotals,
    pub expected: OrderTotals,
}

impl TotalsReport {
    pub fn is_consistent(&self) -> bool {
        self.stored == self.expected
    }
}

/// Read and repair access to order totals outside a line-item write.
#[derive(Clone)]
pub struct OrderTotalsService {
    db_pool: Arc<DbPool>,
    locks: AggregateLocks,
    maintainer: OrderTotalsMaintainer,
}

impl OrderTotalsService {
    pub fn new(db_pool: Arc<DbPool>, locks: AggregateLocks, maintainer: OrderTotalsMaintainer) -> Self {
        Self {
            db_pool,
            locks,
            maintainer,
        }
    }

    /// Compares stored totals with a fresh computation. Writes nothing.
    #[instrument(skip(self))]
    pub async fn verify_order(&self, order_id: i32) -> Result<TotalsReport, ServiceError> {
        let db = &*self.db_pool;
        let order = order::Entity::find_by_id(order_id)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;

        let expected = self.maintainer.expected(db, &order).await?;
        Ok(TotalsReport {
            order_id,
            stored: OrderTotals::of(&order),
            expected,
        })
    }

    /// Brings stored totals back in line and reports what was found beforehand.
    #[instrument(skip(self))]
    pub async fn reconcile_order(&self, order_id: i32) -> Result<TotalsReport, ServiceError> {
        let _guard = self.locks.acquire(AggregateKey::Order(order_id)).await;
        let tx = transaction::begin(&self.db_pool, "reconcile_order").await?;

        let result = async {
            let order = order::Entity::find_by_id(order_id)
                .one(tx.conn())
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| ServiceError::NotFound(format!("order {} not found", order_id)))?;
            let stored = OrderTotals::of(&order);
            let recomputed = self.maintainer.recompute(tx.conn(), order_id).await?;
            Ok::<_, ServiceError>(TotalsReport {
                order_id,
                stored,
                expected: recomputed.totals,
            })
        }
        .await;

        let report = transaction::settle(tx, result).await?;
        if report.is_consistent() {
            info!(order_id, "Order totals consistent");
        } else {
            ORDER_TOTAL_DRIFT.inc();
            warn!(
                order_id,
                stored_total = %report.stored.total,
                expected_total = %report.expected.total,
                "Repaired stale order totals"
            );
        }
        Ok(report)
    }
}
