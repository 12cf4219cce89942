/*!
 * Transaction Helper Utilities
 *
 * Begin/settle pair used by every write path. The work itself runs against a
 * borrowed `&DatabaseTransaction`; `settle` commits on success and rolls back
 * on error. A transaction dropped without settling is rolled back by sea-orm.
 */

use crate::errors::ServiceError;
use metrics::{counter, histogram};
use sea_orm::{DatabaseConnection, DatabaseTransaction, TransactionTrait};
use std::time::Instant;
use tracing::{debug, error, warn};

/// An open transaction plus the moment it started, for duration metrics.
pub struct Tx {
    txn: DatabaseTransaction,
    started: Instant,
    label: &'static str,
}

impl Tx {
    pub fn conn(&self) -> &DatabaseTransaction {
        &self.txn
    }
}

/// Starts a transaction labelled for logs and metrics.
pub async fn begin(db: &DatabaseConnection, label: &'static str) -> Result<Tx, ServiceError> {
    let txn = db.begin().await.map_err(|e| {
        error!(operation = label, error = %e, "Failed to start transaction");
        ServiceError::db_error(e)
    })?;
    counter!("delivery_db.transaction.started", 1, "operation" => label);
    debug!(operation = label, "Transaction started");
    Ok(Tx {
        txn,
        started: Instant::now(),
        label,
    })
}

/// Commits when `result` is `Ok`, rolls back otherwise, and passes the result through.
pub async fn settle<T>(tx: Tx, result: Result<T, ServiceError>) -> Result<T, ServiceError> {
    let Tx {
        txn,
        started,
        label,
    } = tx;

    let outcome = match result {
        Ok(value) => match txn.commit().await {
            Ok(()) => {
                counter!("delivery_db.transaction.committed", 1, "operation" => label);
                debug!(operation = label, "Transaction committed");
                Ok(value)
            }
            Err(e) => {
                error!(operation = label, error = %e, "Transaction commit failed");
                Err(ServiceError::db_error(e))
            }
        },
        Err(err) => {
            if let Err(rollback_err) = txn.rollback().await {
                error!(operation = label, error = %rollback_err, "Transaction rollback failed");
            }
            counter!("delivery_db.transaction.rolled_back", 1, "operation" => label);
            warn!(operation = label, error = %err, "Transaction rolled back");
            Err(err)
        }
    };

    histogram!("delivery_db.transaction.duration", started.elapsed(), "operation" => label);
    outcome
}
