//! Consistency hooks attached to the line-item and review write paths.
//!
//! A hook runs synchronously inside the transaction of the write that fired
//! it. If a hook fails the write fails and the transaction rolls back, so no
//! reader ever observes a child row without its recomputed parent.

use async_trait::async_trait;
use sea_orm::DatabaseTransaction;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineItemChange {
    Inserted,
    Deleted,
}

/// A line item was written for `order_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineItemMutation {
    pub order_id: i32,
    pub menu_item_id: i32,
    pub change: LineItemChange,
}

/// A review was inserted for `restaurant_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReviewMutation {
    pub review_id: i32,
    pub restaurant_id: i32,
}

#[async_trait]
pub trait MutationHook<M>: Send + Sync
where
    M: Sync,
{
    fn name(&self) -> &'static str;

    async fn apply(&self, txn: &DatabaseTransaction, mutation: &M) -> Result<(), ServiceError>;
}

pub type LineItemHook = Arc<dyn MutationHook<LineItemMutation>>;
pub type ReviewHook = Arc<dyn MutationHook<ReviewMutation>>;

/// Hooks registered against each write path, run in registration order.
#[derive(Default, Clone)]
pub struct HookRegistry {
    line_item: Vec<LineItemHook>,
    review: Vec<ReviewHook>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_line_item(mut self, hook: LineItemHook) -> Self {
        self.line_item.push(hook);
        self
    }

    pub fn on_review(mut self, hook: ReviewHook) -> Self {
        self.review.push(hook);
        self
    }

    pub async fn run_line_item(
        &self,
        txn: &DatabaseTransaction,
        mutation: &LineItemMutation,
    ) -> Result<(), ServiceError> {
        for hook in &self.line_item {
            debug!(hook = hook.name(), order_id = mutation.order_id, "Running line item hook");
            hook.apply(txn, mutation).await?;
        }
        Ok(())
    }

    pub async fn run_review(
        &self,
        txn: &DatabaseTransaction,
        mutation: &ReviewMutation,
    ) -> Result<(), ServiceError> {
        for hook in &self.review {
            debug!(
                hook = hook.name(),
                restaurant_id = mutation.restaurant_id,
                "Running review hook"
            );
            hook.apply(txn, mutation).await?;
        }
        Ok(())
    }

    pub fn line_item_hook_names(&self) -> Vec<&'static str> {
        self.line_item.iter().map(|h| h.name()).collect()
    }

    pub fn review_hook_names(&self) -> Vec<&'static str> {
        self.review.iter().map(|h| h.name()).collect()
    }
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("line_item", &self.line_item_hook_names())
            .field("review", &self.review_hook_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{Database, TransactionTrait};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<LineItemMutation>>,
    }

    #[async_trait]
    impl MutationHook<LineItemMutation> for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn apply(
            &self,
            _txn: &DatabaseTransaction,
            mutation: &LineItemMutation,
        ) -> Result<(), ServiceError> {
            self.seen.lock().unwrap().push(*mutation);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl MutationHook<LineItemMutation> for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn apply(
            &self,
            _txn: &DatabaseTransaction,
            mutation: &LineItemMutation,
        ) -> Result<(), ServiceError> {
            Err(ServiceError::ReferentialIntegrityError(format!(
                "order {} does not exist",
                mutation.order_id
            )))
        }
    }

    fn mutation() -> LineItemMutation {
        LineItemMutation {
            order_id: 1,
            menu_item_id: 2,
            change: LineItemChange::Inserted,
        }
    }

    #[tokio::test]
    async fn runs_hooks_in_order_and_stops_at_first_failure() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let txn = db.begin().await.unwrap();

        let first = Arc::new(Recorder::default());
        let last = Arc::new(Recorder::default());
        let registry = HookRegistry::new()
            .on_line_item(first.clone())
            .on_line_item(Arc::new(Failing))
            .on_line_item(last.clone());
        assert_eq!(
            registry.line_item_hook_names(),
            vec!["recorder", "failing", "recorder"]
        );

        let result = registry.run_line_item(&txn, &mutation()).await;
        assert!(matches!(result, Err(ServiceError::ReferentialIntegrityError(_))));
        assert_eq!(first.seen.lock().unwrap().as_slice(), &[mutation()]);
        assert!(last.seen.lock().unwrap().is_empty());
        txn.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn empty_registry_is_a_no_op() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let txn = db.begin().await.unwrap();
        let registry = HookRegistry::new();
        assert!(registry.review_hook_names().is_empty());
        registry
            .run_review(
                &txn,
                &ReviewMutation {
                    review_id: 1,
                    restaurant_id: 1,
                },
            )
            .await
            .unwrap();
        txn.commit().await.unwrap();
    }
}
