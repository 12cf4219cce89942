use sea_orm::error::{DbErr, SqlErr};

/// Errors surfaced by the order, line-item, review and rating services.
///
/// Every variant aborts the enclosing transaction. Nothing here is retried by
/// the core; callers decide their own policy using [`ServiceError::is_retryable`].
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    /// A maintainer ran for a row whose parent no longer exists.
    #[error("Referential integrity violated: {0}")]
    ReferentialIntegrityError(String),

    /// A caller referenced a customer, restaurant, address, order or menu item that does not exist.
    #[error("Invalid reference: {0}")]
    InvalidReferenceError(String),

    #[error("Empty order: {0}")]
    EmptyOrderError(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ConstraintViolationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    ///
    /// Constraint failures reported by the engine are mapped onto the domain
    /// taxonomy so that a racing duplicate insert surfaces the same way as one
    /// caught by an explicit check.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        let err = error.into_db_err();
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(msg)) => {
                ServiceError::ConstraintViolationError(msg)
            }
            Some(SqlErr::ForeignKeyConstraintViolation(msg)) => {
                ServiceError::InvalidReferenceError(msg)
            }
            _ => ServiceError::DatabaseError(err),
        }
    }

    /// Stable machine-readable code for callers and log aggregation.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database_error",
            Self::ReferentialIntegrityError(_) => "referential_integrity",
            Self::InvalidReferenceError(_) => "invalid_reference",
            Self::EmptyOrderError(_) => "empty_order",
            Self::ConstraintViolationError(_) => "constraint_violation",
            Self::NotFound(_) => "not_found",
            Self::InvalidStatus(_) => "invalid_status",
            Self::ConfigError(_) => "config_error",
            Self::InternalError(_) | Self::Other(_) => "internal_error",
        }
    }

    /// Only connection-level database failures are worth retrying; every
    /// domain error is deterministic for the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(DbErr::ConnectionAcquire(_)) | Self::DatabaseError(DbErr::Conn(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[derive(Validate)]
    struct Probe {
        #[validate(range(min = 1, max = 5))]
        rating: i32,
    }

    #[test]
    fn validation_errors_become_constraint_violations() {
        let err: ServiceError = Probe { rating: 9 }.validate().unwrap_err().into();
        assert!(matches!(err, ServiceError::ConstraintViolationError(_)));
        assert_eq!(err.code(), "constraint_violation");
    }

    #[test]
    fn custom_db_errors_stay_database_errors() {
        let err = ServiceError::db_error("boom");
        assert!(matches!(err, ServiceError::DatabaseError(DbErr::Custom(_))));
        assert!(!err.is_retryable());
    }

    #[test]
    fn codes_are_distinct_for_domain_errors() {
        let errors = [
            ServiceError::ReferentialIntegrityError("x".into()),
            ServiceError::InvalidReferenceError("x".into()),
            ServiceError::EmptyOrderError("x".into()),
            ServiceError::ConstraintViolationError("x".into()),
            ServiceError::NotFound("x".into()),
            ServiceError::InvalidStatus("x".into()),
        ];
        let codes: std::collections::HashSet<_> = errors.iter().map(|e| e.code()).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn messages_carry_context() {
        assert_eq!(
            ServiceError::EmptyOrderError("no items".into()).to_string(),
            "Empty order: no items"
        );
    }
}
