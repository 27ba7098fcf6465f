use crate::db::models::{DatabaseGroup, DeletePolicy};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Bookkeeping store the provisioning engine records its resources in.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    type Tx: UnitOfWork + 'static;

    /// Create the bookkeeping tables; existing tables are not an error.
    async fn init_schema(&self) -> Result<()>;

    /// Open a unit of work. Dropping it without `commit` discards its changes.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Every non-deleted database with its non-deleted users.
    async fn list_live(&self) -> Result<Vec<DatabaseGroup>>;

    /// Non-deleted databases whose expiry is before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<DatabaseGroup>>;
}

/// One atomic batch of metadata changes.
#[async_trait]
pub trait UnitOfWork: Send + Sized {
    /// Insert a database row and return its id. A taken name fails with
    /// `DuplicateResource`.
    async fn insert_database(
        &mut self,
        name: &str,
        created_at: DateTime<Utc>,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<i64>;

    /// Insert a user row owned by `database_id` and return its id.
    async fn insert_user(
        &mut self,
        database_id: i64,
        username: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64>;

    /// Expired, non-deleted databases with their users, locked for this unit
    /// of work.
    async fn select_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<DatabaseGroup>>;

    async fn remove_user(&mut self, id: i64, policy: DeletePolicy, now: DateTime<Utc>)
    -> Result<()>;

    async fn remove_database(
        &mut self,
        id: i64,
        policy: DeletePolicy,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}
