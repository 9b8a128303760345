pub use sea_orm_migration::prelude::*;

mod m20250301_000001_create_users_table;
mod m20250301_000002_create_channels_table;
mod m20250301_000003_create_abilities_table;
mod m20250301_000004_create_tokens_table;
mod m20250301_000005_create_subscription_tables;
mod m20250301_000006_create_tasks_table;
mod m20250301_000007_create_logs_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250301_000001_create_users_table::Migration),
            Box::new(m20250301_000002_create_channels_table::Migration),
            Box::new(m20250301_000003_create_abilities_table::Migration),
            Box::new(m20250301_000004_create_tokens_table::Migration),
            Box::new(m20250301_000005_create_subscription_tables::Migration),
            Box::new(m20250301_000006_create_tasks_table::Migration),
            Box::new(m20250301_000007_create_logs_table::Migration),
        ]
    }
}
