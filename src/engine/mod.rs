//! Provisioning engine.
//!
//! [`Engine`] owns the create / list / reclaim choreography over two seams:
//! a [`MetadataStore`] for bookkeeping rows and an [`AdminExecutor`] for the
//! real databases and roles. [`PostgresBackend`] wraps an engine built on the
//! Postgres implementations of both and adds the connection lifecycle.
//!
//! Administrative DDL is not transactional. Each phase writes its metadata row
//! first and issues the DDL inside the same unit of work, so a failing
//! statement rolls the row back. When the commit itself fails after the DDL
//! went through, or the work is cancelled once a role exists, the
//! just-created resource is dropped again on a best-effort basis. A failed
//! user phase also undoes the database phase; anything the undo cannot remove
//! keeps its row and is reclaimed by the sweep.

pub mod postgres;

#[cfg(test)]
mod tests;

pub use postgres::{PgEngine, PostgresBackend};

use crate::admin::AdminExecutor;
use crate::backend::Backend;
use crate::context::OpContext;
use crate::db::{DatabaseGroup, DeletePolicy, MetadataStore, UnitOfWork, transaction};
use crate::error::{Result, TempDbError};
use crate::types::{Clock, CreateOptions, ProvisionedDb, ResolvedCreate, SystemClock};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound for one best-effort compensation statement.
const COMPENSATION_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Engine<S, A> {
    store: S,
    admin: Arc<A>,
    policy: DeletePolicy,
    clock: Arc<dyn Clock>,
}

impl<S: Clone, A> Clone for Engine<S, A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            admin: self.admin.clone(),
            policy: self.policy,
            clock: self.clock.clone(),
        }
    }
}

impl<S, A> Engine<S, A>
where
    S: MetadataStore,
    A: AdminExecutor + 'static,
{
    pub fn new(store: S, admin: A, policy: DeletePolicy) -> Self {
        Self {
            store,
            admin: Arc::new(admin),
            policy,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn admin(&self) -> &A {
        &self.admin
    }

    pub fn policy(&self) -> DeletePolicy {
        self.policy
    }

    pub async fn create(&self, ctx: &OpContext, options: CreateOptions) -> Result<ProvisionedDb> {
        let ResolvedCreate {
            database,
            username,
            password,
            created_at,
            expired_at,
        } = options.resolve(self.clock.now())?;

        let database_id = {
            let admin = self.admin.clone();
            let op_ctx = ctx.clone();
            let name = database.clone();
            transaction(&self.store, ctx, move |tx| {
                Box::pin(async move {
                    let id = tx.insert_database(&name, created_at, expired_at).await?;
                    admin
                        .create_database(&op_ctx, &name)
                        .await
                        .map_err(|e| TempDbError::provisioning("create database", &name, e))?;
                    Ok(id)
                })
            })
            .await
        };
        let database_id = match database_id {
            Ok(id) => id,
            Err(err @ TempDbError::Commit(_)) => {
                compensate_database(self.admin.as_ref(), &database).await;
                return Err(err);
            }
            Err(err) => return Err(err),
        };
        debug!(database = %database, database_id, "database provisioned");

        // Set once CREATE USER went through, so the role is dropped again on
        // any later failure, including a cancelled GRANT.
        let role_created = Arc::new(AtomicBool::new(false));
        let outcome = {
            let admin = self.admin.clone();
            let op_ctx = ctx.clone();
            let database = database.clone();
            let username = username.clone();
            let password = password.clone();
            let role_created = role_created.clone();
            transaction(&self.store, ctx, move |tx| {
                Box::pin(async move {
                    tx.insert_user(database_id, &username, created_at).await?;
                    admin
                        .create_user(&op_ctx, &username, &password)
                        .await
                        .map_err(|e| TempDbError::provisioning("create user", &username, e))?;
                    role_created.store(true, Ordering::SeqCst);
                    admin
                        .grant_all_privileges(&op_ctx, &database, &username)
                        .await
                        .map_err(|e| TempDbError::provisioning("grant privileges", &username, e))
                })
            })
            .await
        };
        if let Err(err) = outcome {
            if role_created.load(Ordering::SeqCst) {
                compensate_user(self.admin.as_ref(), &username).await;
            }
            warn!(
                database = %database,
                username = %username,
                error = %err,
                "user provisioning failed, undoing database"
            );
            self.undo_database(database_id, &database).await;
            return Err(err);
        }

        info!(
            database = %database,
            username = %username,
            expired_at = ?expired_at,
            "provisioned temporary database"
        );
        Ok(ProvisionedDb {
            database,
            username,
            password,
            expired_at,
        })
    }

    pub async fn list(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        let groups = ctx.run(self.store.list_live()).await??;
        Ok(flatten(groups))
    }

    pub async fn list_expired(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        let now = self.clock.now();
        let groups = ctx.run(self.store.list_expired(now)).await??;
        Ok(flatten(groups))
    }

    /// Reclaim every expired group in one unit of work. The first failing
    /// drop aborts the whole batch; drops are idempotent, so a retry converges.
    pub async fn delete_expired(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        let now = self.clock.now();
        let admin = self.admin.clone();
        let op_ctx = ctx.clone();
        let policy = self.policy;

        let groups = transaction(&self.store, ctx, move |tx| {
            Box::pin(async move {
                let groups = tx.select_expired(now).await?;

                for group in &groups {
                    admin
                        .drop_database(&op_ctx, &group.name)
                        .await
                        .map_err(|e| TempDbError::reclamation("drop database", &group.name, e))?;
                }
                for user in groups.iter().flat_map(|g| &g.users) {
                    admin
                        .drop_user(&op_ctx, &user.username)
                        .await
                        .map_err(|e| TempDbError::reclamation("drop user", &user.username, e))?;
                }
                for user in groups.iter().flat_map(|g| &g.users) {
                    tx.remove_user(user.id, policy, now).await?;
                }
                for group in &groups {
                    tx.remove_database(group.id, policy, now).await?;
                }
                Ok(groups)
            })
        })
        .await?;

        if !groups.is_empty() {
            info!(count = groups.len(), policy = ?self.policy, "reclaimed expired databases");
        }
        Ok(flatten(groups))
    }
}

impl<S, A> Engine<S, A>
where
    S: MetadataStore,
    A: AdminExecutor + 'static,
{
    /// Best-effort reversal of phase A. Whatever cannot be undone here keeps
    /// its row and is reclaimed by the sweep once it expires.
    async fn undo_database(&self, database_id: i64, database: &str) {
        let ctx = OpContext::new().with_timeout(COMPENSATION_TIMEOUT);
        if let Err(e) = self.admin.drop_database(&ctx, database).await {
            warn!(database = %database, error = %e, "cannot drop database, left for the sweep");
            return;
        }
        let now = self.clock.now();
        let removed = transaction(&self.store, &ctx, move |tx| {
            Box::pin(async move { tx.remove_database(database_id, DeletePolicy::Hard, now).await })
        })
        .await;
        if let Err(e) = removed {
            warn!(database = %database, error = %e, "cannot remove database row, left for the sweep");
        }
    }
}

fn flatten(groups: Vec<DatabaseGroup>) -> Vec<ProvisionedDb> {
    groups
        .into_iter()
        .flat_map(DatabaseGroup::into_credentials)
        .collect()
}

async fn compensate_database<A: AdminExecutor + ?Sized>(admin: &A, database: &str) {
    let ctx = OpContext::new().with_timeout(COMPENSATION_TIMEOUT);
    match admin.drop_database(&ctx, database).await {
        Ok(()) => info!(database = %database, "dropped database after failed commit"),
        Err(e) => warn!(database = %database, error = %e, "orphaned database left behind"),
    }
}

async fn compensate_user<A: AdminExecutor + ?Sized>(admin: &A, username: &str) {
    let ctx = OpContext::new().with_timeout(COMPENSATION_TIMEOUT);
    match admin.drop_user(&ctx, username).await {
        Ok(()) => info!(username = %username, "dropped role after failed provisioning"),
        Err(e) => warn!(username = %username, error = %e, "orphaned role left behind"),
    }
}

/// An engine built from ready-made parts is connected from the start, so the
/// lifecycle calls only bootstrap the store.
#[async_trait]
impl<S, A> Backend for Engine<S, A>
where
    S: MetadataStore,
    A: AdminExecutor + 'static,
{
    async fn connect(&self, _ctx: &OpContext) -> Result<()> {
        Ok(())
    }

    async fn init(&self, ctx: &OpContext) -> Result<()> {
        ctx.run(self.store.init_schema()).await?
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn create(&self, ctx: &OpContext, options: CreateOptions) -> Result<ProvisionedDb> {
        Engine::create(self, ctx, options).await
    }

    async fn list(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        Engine::list(self, ctx).await
    }

    async fn list_expired(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        Engine::list_expired(self, ctx).await
    }

    async fn delete_expired(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        Engine::delete_expired(self, ctx).await
    }
}
