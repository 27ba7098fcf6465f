use crate::context::OpContext;
use crate::error::Result;
use crate::types::{CreateOptions, ProvisionedDb};
use async_trait::async_trait;

/// Capability contract one provisioning backend offers to the registry and
/// the HTTP layer.
///
/// Lifecycle: `connect`, then `init`, then any number of `create` / `list` /
/// `delete_expired` calls, then `disconnect`. Calls out of order fail with
/// `TempDbError::InvalidState`.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn connect(&self, ctx: &OpContext) -> Result<()>;

    /// Bootstrap the management database and its tables. Idempotent.
    async fn init(&self, ctx: &OpContext) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Provision one database and one credential owning it.
    async fn create(&self, ctx: &OpContext, options: CreateOptions) -> Result<ProvisionedDb>;

    /// Every live credential. Passwords are empty.
    async fn list(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>>;

    /// Live credentials whose database has expired but was not reclaimed yet.
    async fn list_expired(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>>;

    /// Drop every expired database and its users, returning what was reclaimed.
    async fn delete_expired(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>>;
}
