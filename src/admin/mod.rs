//! Administrative surface: real databases, roles and grants.
//!
//! None of these statements run inside the metadata unit of work, and none are
//! retried here. Identifiers are always quoted with [`quote_ident`] and
//! passwords with [`quote_literal`].

pub mod postgres;

pub use postgres::PgAdmin;

use crate::context::OpContext;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait AdminExecutor: Send + Sync {
    async fn create_database(&self, ctx: &OpContext, name: &str) -> Result<()>;

    /// Idempotent: dropping a missing database succeeds.
    async fn drop_database(&self, ctx: &OpContext, name: &str) -> Result<()>;

    async fn create_user(&self, ctx: &OpContext, username: &str, password: &str) -> Result<()>;

    /// Idempotent: dropping a missing role succeeds.
    async fn drop_user(&self, ctx: &OpContext, username: &str) -> Result<()>;

    async fn grant_all_privileges(&self, ctx: &OpContext, database: &str, username: &str)
    -> Result<()>;
}

/// Quote an identifier for Postgres: wrap in double quotes, double any
/// embedded double quote.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Quote a string literal for Postgres. Literals containing a backslash use
/// the `E'...'` escape form with backslashes doubled.
pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{escaped}'")
    }
}

/// Accepts every statement without touching a server.
#[cfg(test)]
pub(crate) struct NoopAdmin;

#[cfg(test)]
#[async_trait]
impl AdminExecutor for NoopAdmin {
    async fn create_database(&self, _: &OpContext, _: &str) -> Result<()> {
        Ok(())
    }
    async fn drop_database(&self, _: &OpContext, _: &str) -> Result<()> {
        Ok(())
    }
    async fn create_user(&self, _: &OpContext, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
    async fn drop_user(&self, _: &OpContext, _: &str) -> Result<()> {
        Ok(())
    }
    async fn grant_all_privileges(&self, _: &OpContext, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}
