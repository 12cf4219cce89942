pub use sea_orm_migration::prelude::*;

mod m20240601_000001_create_reference_tables;
mod m20240601_000002_create_orders_tables;
mod m20240601_000003_create_payments_and_reviews;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_reference_tables::Migration),
            Box::new(m20240601_000002_create_orders_tables::Migration),
            Box::new(m20240601_000003_create_payments_and_reviews::Migration),
        ]
    }
}
