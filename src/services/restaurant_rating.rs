use crate::{
    db::{transaction, AggregateKey, AggregateLocks, DbPool},
    entities::{restaurant, review},
    errors::ServiceError,
    hooks::{MutationHook, ReviewMutation},
    pricing::rating_average,
};
use async_trait::async_trait;
use lazy_static::lazy_static;
use prometheus::IntCounter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait,
    QueryFilter, QuerySelect, Set,
};
use std::sync::Arc;
use tracing::{debug, error, instrument};

lazy_static! {
    pub(crate) static ref RATING_RECOMPUTATIONS: IntCounter = IntCounter::new(
        "restaurant_rating_recomputations_total",
        "Number of restaurant rating recomputations that changed the stored average"
    )
    .expect("metric can be created");
}

/// Keeps `restaurants.rating_avg` equal to the mean of the restaurant's
/// review ratings. Registered as a review hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct RestaurantRatingMaintainer;

impl RestaurantRatingMaintainer {
    pub fn new() -> Self {
        Self
    }

    /// Mean rating over every review of `restaurant_id`, `None` without reviews.
    pub async fn expected<C: ConnectionTrait>(
        &self,
        conn: &C,
        restaurant_id: i32,
    ) -> Result<Option<Decimal>, ServiceError> {
        let ratings: Vec<i32> = review::Entity::find()
            .select_only()
            .column(review::Column::Rating)
            .filter(review::Column::RestaurantId.eq(restaurant_id))
            .into_tuple()
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(rating_average(&ratings))
    }

    /// Recomputes and stores the rating of `restaurant_id` inside the caller's
    /// transaction, returning the new average.
    pub async fn recompute<C: ConnectionTrait>(
        &self,
        conn: &C,
        restaurant_id: i32,
    ) -> Result<Option<Decimal>, ServiceError> {
        let restaurant = restaurant::Entity::find_by_id(restaurant_id)
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                error!(restaurant_id, "Review mutation for a restaurant that does not exist");
                ServiceError::ReferentialIntegrityError(format!(
                    "restaurant {} does not exist",
                    restaurant_id
                ))
            })?;

        let average = self.expected(conn, restaurant_id).await?;
        if restaurant.rating_avg == average {
            debug!(restaurant_id, "Restaurant rating already current");
            return Ok(average);
        }

        let mut active: restaurant::ActiveModel = restaurant.into();
        active.rating_avg = Set(average);
        active.update(conn).await.map_err(ServiceError::db_error)?;

        RATING_RECOMPUTATIONS.inc();
        debug!(restaurant_id, rating_avg = ?average, "Restaurant rating recomputed");
        Ok(average)
    }
}

#[async_trait]
impl MutationHook<ReviewMutation> for RestaurantRatingMaintainer {
    fn name(&self) -> &'static str {
        "restaurant_rating"
    }

    async fn apply(
        &self,
        txn: &DatabaseTransaction,
        mutation: &ReviewMutation,
    ) -> Result<(), ServiceError> {
        self.recompute(txn, mutation.restaurant_id).await.map(|_| ())
    }
}

#[derive(Clone)]
pub struct RestaurantRatingService {
    db_pool: Arc<DbPool>,
    locks: AggregateLocks,
    maintainer: RestaurantRatingMaintainer,
}

impl RestaurantRatingService {
    pub fn new(db_pool: Arc<DbPool>, locks: AggregateLocks) -> Self {
        Self {
            db_pool,
            locks,
            maintainer: RestaurantRatingMaintainer::new(),
        }
    }

    /// Stored average rating; `None` until the restaurant has a review.
    #[instrument(skip(self))]
    pub async fn get_rating(&self, restaurant_id: i32) -> Result<Option<Decimal>, ServiceError> {
        let restaurant = restaurant::Entity::find_by_id(restaurant_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("restaurant {} not found", restaurant_id))
            })?;
        Ok(restaurant.rating_avg)
    }

    /// Recomputes the stored average from the reviews currently on file.
    #[instrument(skip(self))]
    pub async fn reconcile_rating(&self, restaurant_id: i32) -> Result<Option<Decimal>, ServiceError> {
        let _guard = self
            .locks
            .acquire(AggregateKey::Restaurant(restaurant_id))
            .await;
        let tx = transaction::begin(&self.db_pool, "reconcile_rating").await?;
        let result = self.maintainer.recompute(tx.conn(), restaurant_id).await;
        transaction::settle(tx, result).await
    }
}
