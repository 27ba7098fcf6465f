use super::{AdminExecutor, quote_ident, quote_literal};
use crate::context::OpContext;
use crate::error::{Result, TempDbError};
use async_trait::async_trait;
use sqlx::{Executor, PgPool};
use tracing::debug;

/// Issues administrative statements on the root connection pool.
#[derive(Clone)]
pub struct PgAdmin {
    pool: PgPool,
    force_drop: bool,
}

impl PgAdmin {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            force_drop: false,
        }
    }

    /// Terminate other sessions when dropping a database (`WITH (FORCE)`, Postgres 13+).
    pub fn with_force_drop(mut self, force_drop: bool) -> Self {
        self.force_drop = force_drop;
        self
    }

    async fn exec(&self, ctx: &OpContext, statement: &'static str, sql: String) -> Result<()> {
        debug!(statement, "issuing administrative statement");
        ctx.run(self.pool.execute(sql.as_str()))
            .await?
            .map_err(|source| TempDbError::Admin { statement, source })?;
        Ok(())
    }
}

pub(crate) fn drop_database_sql(name: &str, force: bool) -> String {
    if force {
        format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", quote_ident(name))
    } else {
        format!("DROP DATABASE IF EXISTS {}", quote_ident(name))
    }
}

pub(crate) fn create_user_sql(username: &str, password: &str) -> String {
    format!(
        "CREATE USER {} WITH ENCRYPTED PASSWORD {}",
        quote_ident(username),
        quote_literal(password)
    )
}

#[async_trait]
impl AdminExecutor for PgAdmin {
    async fn create_database(&self, ctx: &OpContext, name: &str) -> Result<()> {
        let sql = format!("CREATE DATABASE {}", quote_ident(name));
        self.exec(ctx, "CREATE DATABASE", sql).await
    }

    async fn drop_database(&self, ctx: &OpContext, name: &str) -> Result<()> {
        self.exec(ctx, "DROP DATABASE", drop_database_sql(name, self.force_drop))
            .await
    }

    async fn create_user(&self, ctx: &OpContext, username: &str, password: &str) -> Result<()> {
        self.exec(ctx, "CREATE USER", create_user_sql(username, password))
            .await
    }

    async fn drop_user(&self, ctx: &OpContext, username: &str) -> Result<()> {
        let sql = format!("DROP USER IF EXISTS {}", quote_ident(username));
        self.exec(ctx, "DROP USER", sql).await
    }

    async fn grant_all_privileges(
        &self,
        ctx: &OpContext,
        database: &str,
        username: &str,
    ) -> Result<()> {
        let sql = format!(
            "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
            quote_ident(database),
            quote_ident(username)
        );
        self.exec(ctx, "GRANT", sql).await
    }
}
