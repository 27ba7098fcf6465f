use super::Engine;
use crate::admin::{AdminExecutor, PgAdmin};
use crate::backend::Backend;
use crate::config::PostgresConfig;
use crate::context::OpContext;
use crate::db::postgres::DUPLICATE_DATABASE;
use crate::db::{MetadataStore, PgMetadataStore};
use crate::error::{Result, TempDbError};
use crate::types::{Clock, CreateOptions, ProvisionedDb, SystemClock};
use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{debug, info};

pub type PgEngine = Engine<PgMetadataStore, PgAdmin>;

enum State {
    Unconnected,
    RootConnected { root: PgPool },
    Ready { root: PgPool, engine: PgEngine },
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Unconnected => "unconnected",
            State::RootConnected { .. } => "root-connected",
            State::Ready { .. } => "ready",
        }
    }
}

/// Postgres provisioning backend: a root pool for administrative statements
/// and a management pool for bookkeeping.
pub struct PostgresBackend {
    config: PostgresConfig,
    clock: Arc<dyn Clock>,
    state: RwLock<State>,
}

impl PostgresBackend {
    pub fn new(config: PostgresConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            clock: Arc::new(SystemClock),
            state: RwLock::new(State::Unconnected),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    pub fn state_name(&self) -> &'static str {
        self.state.read().name()
    }

    fn engine(&self) -> Result<PgEngine> {
        match &*self.state.read() {
            State::Ready { engine, .. } => Ok(engine.clone()),
            other => Err(TempDbError::InvalidState {
                expected: "ready",
                actual: other.name(),
            }),
        }
    }

    /// Root pool plus the engine when already initialised.
    fn root_for_init(&self) -> Result<(PgPool, Option<PgEngine>)> {
        match &*self.state.read() {
            State::RootConnected { root } => Ok((root.clone(), None)),
            State::Ready { root, engine } => Ok((root.clone(), Some(engine.clone()))),
            State::Unconnected => Err(TempDbError::InvalidState {
                expected: "root-connected",
                actual: "unconnected",
            }),
        }
    }

    async fn open_pool(&self, ctx: &OpContext, database: &str) -> Result<PgPool> {
        let target = self.config.target(database);
        let options = self.config.connect_options(database)?;
        let pool = ctx
            .run(
                PgPoolOptions::new()
                    .max_connections(self.config.max_connections)
                    .acquire_timeout(self.config.connect_timeout)
                    .connect_with(options),
            )
            .await?
            .map_err(|source| TempDbError::Connection {
                target: target.clone(),
                source,
            })?;

        match ctx.run(sqlx::query("SELECT 1").execute(&pool)).await {
            Ok(Ok(_)) => {
                debug!(server = %target, "liveness probe succeeded");
                Ok(pool)
            }
            Ok(Err(source)) => {
                pool.close().await;
                Err(TempDbError::Connection { target, source })
            }
            Err(ctx_err) => {
                pool.close().await;
                Err(ctx_err)
            }
        }
    }

    fn build_engine(&self, root: PgPool, management: PgPool) -> PgEngine {
        let admin = PgAdmin::new(root).with_force_drop(self.config.force_drop);
        Engine::new(
            PgMetadataStore::new(management),
            admin,
            self.config.delete_policy(),
        )
        .with_clock(self.clock.clone())
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn connect(&self, ctx: &OpContext) -> Result<()> {
        let actual = self.state_name();
        if actual != "unconnected" {
            return Err(TempDbError::InvalidState {
                expected: "unconnected",
                actual,
            });
        }

        let root = self.open_pool(ctx, &self.config.root_database).await?;

        let raced = {
            let mut state = self.state.write();
            if matches!(*state, State::Unconnected) {
                *state = State::RootConnected { root: root.clone() };
                None
            } else {
                Some(state.name())
            }
        };
        if let Some(actual) = raced {
            root.close().await;
            return Err(TempDbError::InvalidState {
                expected: "unconnected",
                actual,
            });
        }

        info!(
            server = %self.config.target(&self.config.root_database),
            "root connection established"
        );
        Ok(())
    }

    async fn init(&self, ctx: &OpContext) -> Result<()> {
        let (root, existing) = self.root_for_init()?;
        let management_db = self.config.management_database.as_str();

        let bootstrap = PgAdmin::new(root.clone());
        match bootstrap.create_database(ctx, management_db).await {
            Ok(()) => info!(database = %management_db, "created management database"),
            Err(e) if e.sqlstate().as_deref() == Some(DUPLICATE_DATABASE) => {
                debug!(database = %management_db, "management database already exists");
            }
            Err(e) if e.is_context() => return Err(e),
            Err(e) => {
                return Err(TempDbError::Initialization {
                    step: "management database",
                    source: Box::new(e),
                });
            }
        }

        let (engine, fresh) = match existing {
            Some(engine) => (engine, false),
            None => {
                let management = self.open_pool(ctx, management_db).await?;
                (self.build_engine(root.clone(), management), true)
            }
        };

        if let Err(e) = ctx.run(engine.store().init_schema()).await.and_then(|r| r) {
            if fresh {
                engine.store().pool().close().await;
            }
            return Err(e);
        }

        if fresh {
            let raced = {
                let mut state = self.state.write();
                if matches!(*state, State::RootConnected { .. }) {
                    *state = State::Ready {
                        root,
                        engine: engine.clone(),
                    };
                    None
                } else {
                    Some(state.name())
                }
            };
            if let Some(actual) = raced {
                engine.store().pool().close().await;
                return Err(TempDbError::InvalidState {
                    expected: "root-connected",
                    actual,
                });
            }
        }

        info!(database = %management_db, "backend ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.state.write(), State::Unconnected);
        match previous {
            State::Unconnected => {}
            State::RootConnected { root } => root.close().await,
            State::Ready { root, engine } => {
                root.close().await;
                engine.store().pool().close().await;
            }
        }
        info!("backend disconnected");
        Ok(())
    }

    async fn create(&self, ctx: &OpContext, options: CreateOptions) -> Result<ProvisionedDb> {
        self.engine()?.create(ctx, options).await
    }

    async fn list(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        self.engine()?.list(ctx).await
    }

    async fn list_expired(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        self.engine()?.list_expired(ctx).await
    }

    async fn delete_expired(&self, ctx: &OpContext) -> Result<Vec<ProvisionedDb>> {
        self.engine()?.delete_expired(ctx).await
    }
}
