use crate::db::models::{DatabaseGroup, DeletePolicy, JoinedRow, group_rows};
use crate::db::schema::{POSTGRES_INIT, statements};
use crate::db::store::{MetadataStore, UnitOfWork};
use crate::error::{ResourceKind, Result, TempDbError, sqlstate_of};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

/// SQLSTATE codes treated as "already exists" while bootstrapping.
pub const DUPLICATE_DATABASE: &str = "42P04";
pub const DUPLICATE_TABLE: &str = "42P07";
pub const DUPLICATE_OBJECT: &str = "42710";
/// Concurrent `CREATE TABLE IF NOT EXISTS` usually loses on `pg_type`.
pub const UNIQUE_VIOLATION: &str = "23505";

/// Transaction-scoped advisory lock serializing schema bootstrap between
/// processes sharing a management database.
const BOOTSTRAP_LOCK: &str = "SELECT pg_advisory_xact_lock(hashtext('tempdb.bootstrap'))";

const SELECT_JOINED: &str = r#"
    SELECT d.id AS database_id, d.name AS database_name, d.expired_at,
           u.id AS user_id, u.username
    FROM databases AS d
    LEFT JOIN users AS u
        ON u.database_id = d.id AND u.deleted_at IS NULL
"#;

#[derive(Clone)]
pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map an insert failure, turning a unique violation into `DuplicateResource`.
fn insert_error(err: sqlx::Error, kind: ResourceKind, name: &str) -> TempDbError {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return TempDbError::DuplicateResource {
            kind,
            name: name.to_string(),
        };
    }
    TempDbError::Store(err)
}

/// Whether a bootstrap failure means another initializer created the same
/// objects concurrently. Such a failure is retried once; the `IF NOT EXISTS`
/// DDL then sees the committed objects.
pub(crate) fn is_bootstrap_race(code: Option<&str>) -> bool {
    matches!(
        code,
        Some(DUPLICATE_TABLE) | Some(DUPLICATE_OBJECT) | Some(UNIQUE_VIOLATION)
    )
}

impl PgMetadataStore {
    /// Run the whole DDL script in one transaction.
    async fn run_bootstrap(&self) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(BOOTSTRAP_LOCK).execute(&mut *tx).await?;
        for stmt in statements(POSTGRES_INIT) {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
        tx.commit().await
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    type Tx = PgUnitOfWork;

    async fn init_schema(&self) -> Result<()> {
        let outcome = match self.run_bootstrap().await {
            Err(e) if is_bootstrap_race(sqlstate_of(&e).as_deref()) => {
                debug!(error = %e, "bookkeeping bootstrap raced, retrying once");
                self.run_bootstrap().await
            }
            other => other,
        };
        outcome.map_err(|e| TempDbError::Initialization {
            step: "bookkeeping tables",
            source: Box::new(TempDbError::Store(e)),
        })
    }

    async fn begin(&self) -> Result<Self::Tx> {
        let tx = self.pool.begin().await?;
        Ok(PgUnitOfWork { tx })
    }

    async fn list_live(&self) -> Result<Vec<DatabaseGroup>> {
        let rows: Vec<JoinedRow> = sqlx::query_as(&format!(
            "{SELECT_JOINED} WHERE d.deleted_at IS NULL ORDER BY d.id, u.id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(group_rows(rows))
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<DatabaseGroup>> {
        let rows: Vec<JoinedRow> = sqlx::query_as(&format!(
            "{SELECT_JOINED} WHERE d.deleted_at IS NULL AND d.expired_at IS NOT NULL AND d.expired_at < $1 \
             ORDER BY d.id, u.id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(group_rows(rows))
    }
}

pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn insert_database(
        &mut self,
        name: &str,
        created_at: DateTime<Utc>,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let rec: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO databases (name, created_at, expired_at)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(name)
        .bind(created_at)
        .bind(expired_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| insert_error(e, ResourceKind::Database, name))?;
        Ok(rec.0)
    }

    async fn insert_user(
        &mut self,
        database_id: i64,
        username: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let rec: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO users (username, database_id, created_at)
            VALUES ($1, $2, $3)
            RETURNING id
            "#,
        )
        .bind(username)
        .bind(database_id)
        .bind(created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| insert_error(e, ResourceKind::User, username))?;
        Ok(rec.0)
    }

    async fn select_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<DatabaseGroup>> {
        // SKIP LOCKED: a concurrent sweep owns those groups
        let rows: Vec<JoinedRow> = sqlx::query_as(&format!(
            "{SELECT_JOINED} WHERE d.deleted_at IS NULL AND d.expired_at IS NOT NULL AND d.expired_at < $1 \
             ORDER BY d.id, u.id FOR UPDATE OF d SKIP LOCKED"
        ))
        .bind(now)
        .fetch_all(&mut *self.tx)
        .await?;
        Ok(group_rows(rows))
    }

    async fn remove_user(&mut self, id: i64, policy: DeletePolicy, now: DateTime<Utc>) -> Result<()> {
        match policy {
            DeletePolicy::Soft => {
                sqlx::query("UPDATE users SET deleted_at = $1 WHERE id = $2")
                    .bind(now)
                    .bind(id)
                    .execute(&mut *self.tx)
                    .await?;
            }
            DeletePolicy::Hard => {
                sqlx::query("DELETE FROM users WHERE id = $1")
                    .bind(id)
                    .execute(&mut *self.tx)
                    .await?;
            }
        }
        Ok(())
    }

    async fn remove_database(
        &mut self,
        id: i64,
        policy: DeletePolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match policy {
            DeletePolicy::Soft => {
                sqlx::query("UPDATE databases SET deleted_at = $1 WHERE id = $2")
                    .bind(now)
                    .bind(id)
                    .execute(&mut *self.tx)
                    .await?;
            }
            DeletePolicy::Hard => {
                sqlx::query("DELETE FROM databases WHERE id = $1")
                    .bind(id)
                    .execute(&mut *self.tx)
                    .await?;
            }
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
