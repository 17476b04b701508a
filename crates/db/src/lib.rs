use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

pub mod entities;
pub mod models;
pub mod types;

pub use sea_orm::{ConnectionTrait, DatabaseConnection as DbConnection, DbErr, TransactionTrait};

#[derive(Clone)]
pub struct DBService {
    pub conn: DatabaseConnection,
}

impl DBService {
    /// Connects and brings the schema up to date. For SQLite pass a
    /// `sqlite://...?mode=rwc` URL so the file is created on first run.
    pub async fn new(database_url: &str) -> Result<DBService, DbErr> {
        let mut options = ConnectOptions::new(database_url.to_string());
        options
            .connect_timeout(Duration::from_secs(30))
            .sqlx_logging(false);

        let conn = Database::connect(options).await?;
        db_migration::Migrator::up(&conn, None).await?;
        tracing::debug!("database schema is up to date");
        Ok(DBService { conn })
    }
}
