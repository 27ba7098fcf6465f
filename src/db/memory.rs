//! In-memory metadata store.
//!
//! Units of work are serialised: a unit of work holds the table lock from
//! `begin` until `commit`/`rollback`/drop, and anything short of `commit`
//! restores the snapshot taken at `begin`. Uniqueness and foreign-key rules
//! follow the Postgres schema, soft-deleted rows included.

use crate::db::models::{DatabaseGroup, DatabaseRecord, DeletePolicy, JoinedRow, UserRecord, group_rows};
use crate::db::store::{MetadataStore, UnitOfWork};
use crate::error::{ResourceKind, Result, TempDbError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Tables {
    databases: BTreeMap<i64, DatabaseRecord>,
    users: BTreeMap<i64, UserRecord>,
    last_database_id: i64,
    last_user_id: i64,
}

impl Tables {
    fn joined(&self, keep: impl Fn(&DatabaseRecord) -> bool) -> Vec<DatabaseGroup> {
        let mut rows = Vec::new();
        for db in self.databases.values().filter(|d| d.deleted_at.is_none() && keep(d)) {
            let mut users = self
                .users
                .values()
                .filter(|u| u.database_id == db.id && u.deleted_at.is_none())
                .peekable();
            if users.peek().is_none() {
                rows.push(JoinedRow {
                    database_id: db.id,
                    database_name: db.name.clone(),
                    expired_at: db.expired_at,
                    user_id: None,
                    username: None,
                });
            }
            for user in users {
                rows.push(JoinedRow {
                    database_id: db.id,
                    database_name: db.name.clone(),
                    expired_at: db.expired_at,
                    user_id: Some(user.id),
                    username: Some(user.username.clone()),
                });
            }
        }
        group_rows(rows)
    }

    fn expired(&self, now: DateTime<Utc>) -> Vec<DatabaseGroup> {
        self.joined(|d| d.expired_at.is_some_and(|at| at < now))
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn database_by_name(&self, name: &str) -> Option<DatabaseRecord> {
        let tables = self.tables.lock().await;
        tables.databases.values().find(|d| d.name == name).cloned()
    }

    pub async fn user_by_name(&self, username: &str) -> Option<UserRecord> {
        let tables = self.tables.lock().await;
        tables.users.values().find(|u| u.username == username).cloned()
    }

    /// Row counts `(databases, users)`, deleted rows included.
    pub async fn row_counts(&self) -> (usize, usize) {
        let tables = self.tables.lock().await;
        (tables.databases.len(), tables.users.len())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    type Tx = MemoryUnitOfWork;

    async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn begin(&self) -> Result<Self::Tx> {
        let guard = self.tables.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(MemoryUnitOfWork {
            guard: Some(guard),
            snapshot,
        })
    }

    async fn list_live(&self) -> Result<Vec<DatabaseGroup>> {
        Ok(self.tables.lock().await.joined(|_| true))
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<DatabaseGroup>> {
        Ok(self.tables.lock().await.expired(now))
    }
}

pub struct MemoryUnitOfWork {
    guard: Option<OwnedMutexGuard<Tables>>,
    snapshot: Tables,
}

impl MemoryUnitOfWork {
    fn tables(&mut self) -> Result<&mut Tables> {
        self.guard
            .as_deref_mut()
            .ok_or_else(|| TempDbError::Store(sqlx::Error::Protocol("unit of work already finished".into())))
    }

    fn restore(&mut self) {
        if let Some(mut guard) = self.guard.take() {
            *guard = std::mem::take(&mut self.snapshot);
        }
    }
}

impl Drop for MemoryUnitOfWork {
    fn drop(&mut self) {
        self.restore();
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn insert_database(
        &mut self,
        name: &str,
        created_at: DateTime<Utc>,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let tables = self.tables()?;
        if tables.databases.values().any(|d| d.name == name) {
            return Err(TempDbError::DuplicateResource {
                kind: ResourceKind::Database,
                name: name.to_string(),
            });
        }
        tables.last_database_id += 1;
        let id = tables.last_database_id;
        tables.databases.insert(
            id,
            DatabaseRecord {
                id,
                name: name.to_string(),
                created_at,
                expired_at,
                deleted_at: None,
            },
        );
        Ok(id)
    }

    async fn insert_user(
        &mut self,
        database_id: i64,
        username: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        let tables = self.tables()?;
        if !tables.databases.contains_key(&database_id) {
            return Err(TempDbError::Store(sqlx::Error::Protocol(format!(
                "foreign key violation: database {database_id} does not exist"
            ))));
        }
        if tables.users.values().any(|u| u.username == username) {
            return Err(TempDbError::DuplicateResource {
                kind: ResourceKind::User,
                name: username.to_string(),
            });
        }
        tables.last_user_id += 1;
        let id = tables.last_user_id;
        tables.users.insert(
            id,
            UserRecord {
                id,
                username: username.to_string(),
                database_id,
                created_at,
                deleted_at: None,
            },
        );
        Ok(id)
    }

    async fn select_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<DatabaseGroup>> {
        Ok(self.tables()?.expired(now))
    }

    async fn remove_user(&mut self, id: i64, policy: DeletePolicy, now: DateTime<Utc>) -> Result<()> {
        let tables = self.tables()?;
        match policy {
            DeletePolicy::Hard => {
                tables.users.remove(&id);
            }
            DeletePolicy::Soft => {
                if let Some(user) = tables.users.get_mut(&id) {
                    user.deleted_at = Some(now);
                }
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
        let tables = self.tables()?;
        match policy {
            DeletePolicy::Hard => {
                if tables.users.values().any(|u| u.database_id == id) {
                    return Err(TempDbError::Store(sqlx::Error::Protocol(format!(
                        "foreign key violation: users still reference database {id}"
                    ))));
                }
                tables.databases.remove(&id);
            }
            DeletePolicy::Soft => {
                if let Some(db) = tables.databases.get_mut(&id) {
                    db.deleted_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        self.tables()?;
        // releasing the guard without restoring keeps the changes
        self.guard.take();
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.restore();
        Ok(())
    }
}
