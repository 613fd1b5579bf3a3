use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use sea_orm_migration::MigratorTrait;

pub mod entities;
pub mod models;
mod retry;
pub mod store;

pub use sea_orm::DbErr;
pub use store::{
    Document, DocumentStore, Filter, MemoryDocumentStore, Patch, SqlDocumentStore, StoreError,
    UniqueIndex, UpdateResult,
};

#[derive(Clone)]
pub struct DBService {
    pub conn: DatabaseConnection,
}

impl DBService {
    /// Connects and brings the document tables up to date.
    pub async fn new(database_url: &str) -> Result<DBService, DbErr> {
        let mut options = ConnectOptions::new(database_url.to_string());
        options.sqlx_logging(false);
        let conn = Database::connect(options).await?;
        db_migration::Migrator::up(&conn, None).await?;
        tracing::debug!("Document store schema is up to date");
        Ok(DBService { conn })
    }

    pub fn document_store(&self) -> SqlDocumentStore {
        SqlDocumentStore::new(self.conn.clone())
    }
}
