use crate::{
    db::{transaction, AggregateKey, AggregateLocks, DbPool},
    entities::{customer, order, restaurant, review},
    errors::ServiceError,
    events::{Event, EventSender},
    hooks::{HookRegistry, ReviewMutation},
};
use chrono::Utc;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;

lazy_static! {
    pub(crate) static ref REVIEWS_ADDED: IntCounter =
        IntCounter::new("reviews_added_total", "Total number of reviews recorded")
            .expect("metric can be created");
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AddReviewRequest {
    pub order_id: i32,
    pub customer_id: i32,
    pub restaurant_id: i32,
    #[validate(range(min = 1, max = 5, message = "Rating must be between 1 and 5"))]
    pub rating: i32,
    #[validate(length(max = 2000))]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewWrite {
    pub review: review::Model,
    /// Restaurant average after this review was counted.
    pub rating_avg: Option<Decimal>,
}

/// Reviews are append-only; each insert refreshes the restaurant's average
/// in the same transaction.
#[derive(Clone)]
pub struct ReviewService {
    db_pool: Arc<DbPool>,
    locks: AggregateLocks,
    hooks: Arc<HookRegistry>,
    event_sender: Option<Arc<EventSender>>,
}

impl ReviewService {
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

    #[instrument(skip(self, request), fields(restaurant_id = request.restaurant_id, order_id = request.order_id))]
    pub async fn insert_review(&self, request: AddReviewRequest) -> Result<ReviewWrite, ServiceError> {
        request.validate()?;

        let _guard = self
            .locks
            .acquire(AggregateKey::Restaurant(request.restaurant_id))
            .await;
        let tx = transaction::begin(&self.db_pool, "insert_review").await?;

        let result = async {
            check_references(tx.conn(), &request).await?;

            let review = review::ActiveModel {
                order_id: Set(request.order_id),
                customer_id: Set(request.customer_id),
                restaurant_id: Set(request.restaurant_id),
                rating: Set(request.rating),
                comment: Set(request.comment.clone()),
                created_at: Set(Utc::now()),
                ..Default::default()
            }
            .insert(tx.conn())
            .await
            .map_err(ServiceError::db_error)?;

            self.hooks
                .run_review(
                    tx.conn(),
                    &ReviewMutation {
                        review_id: review.id,
                        restaurant_id: review.restaurant_id,
                    },
                )
                .await?;

            let rating_avg = restaurant::Entity::find_by_id(request.restaurant_id)
                .one(tx.conn())
                .await
                .map_err(ServiceError::db_error)?
                .and_then(|r| r.rating_avg);

            Ok::<_, ServiceError>(ReviewWrite { review, rating_avg })
        }
        .await;

        let write = transaction::settle(tx, result).await.map_err(|e| {
            error!(error = %e, "Failed to record review");
            e
        })?;

        REVIEWS_ADDED.inc();
        info!(review_id = write.review.id, rating_avg = ?write.rating_avg, "Review recorded");

        self.publish(Event::ReviewAdded {
            review_id: write.review.id,
            restaurant_id: write.review.restaurant_id,
            rating: write.review.rating,
        })
        .await;
        self.publish(Event::RestaurantRatingUpdated {
            restaurant_id: write.review.restaurant_id,
            rating_avg: write.rating_avg,
        })
        .await;

        Ok(write)
    }

    pub async fn list_reviews(&self, restaurant_id: i32) -> Result<Vec<review::Model>, ServiceError> {
        review::Entity::find()
            .filter(review::Column::RestaurantId.eq(restaurant_id))
            .order_by_asc(review::Column::Id)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send review event");
            }
        }
    }
}

async fn check_references(
    txn: &DatabaseTransaction,
    request: &AddReviewRequest,
) -> Result<(), ServiceError> {
    let order = order::Entity::find_by_id(request.order_id)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::InvalidReferenceError(format!("order {} does not exist", request.order_id))
        })?;

    customer::Entity::find_by_id(request.customer_id)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::InvalidReferenceError(format!(
                "customer {} does not exist",
                request.customer_id
            ))
        })?;

    restaurant::Entity::find_by_id(request.restaurant_id)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)?
        .ok_or_else(|| {
            ServiceError::InvalidReferenceError(format!(
                "restaurant {} does not exist",
                request.restaurant_id
            ))
        })?;

    if order.restaurant_id != request.restaurant_id || order.customer_id != request.customer_id {
        return Err(ServiceError::ConstraintViolationError(format!(
            "order {} was not placed by customer {} at restaurant {}",
            request.order_id, request.customer_id, request.restaurant_id
        )));
    }

    Ok(())
}
