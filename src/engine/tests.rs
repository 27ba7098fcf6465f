use super::*;
use crate::db::MemoryStore;
use crate::db::memory::MemoryUnitOfWork;
use crate::error::{ContextError, ResourceKind};
use crate::types::ManualClock;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Administrative fake that keeps the resulting server state in memory and
/// can be told to fail or hang on one statement kind.
#[derive(Default)]
struct RecordingAdmin {
    databases: Mutex<BTreeSet<String>>,
    roles: Mutex<BTreeSet<String>>,
    grants: Mutex<Vec<(String, String)>>,
    fail_on: Mutex<Option<&'static str>>,
    hang_on: Mutex<Option<&'static str>>,
}

impl RecordingAdmin {
    fn fail_on(&self, statement: &'static str) {
        *self.fail_on.lock() = Some(statement);
    }

    fn hang_on(&self, statement: &'static str) {
        *self.hang_on.lock() = Some(statement);
    }

    fn databases(&self) -> BTreeSet<String> {
        self.databases.lock().clone()
    }

    fn roles(&self) -> BTreeSet<String> {
        self.roles.lock().clone()
    }

    async fn check(&self, statement: &'static str) -> Result<()> {
        let hang = *self.hang_on.lock() == Some(statement);
        if hang {
            std::future::pending::<()>().await;
        }
        if *self.fail_on.lock() == Some(statement) {
            return Err(TempDbError::Admin {
                statement,
                source: sqlx::Error::Protocol("injected failure".into()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AdminExecutor for RecordingAdmin {
    async fn create_database(&self, ctx: &OpContext, name: &str) -> Result<()> {
        ctx.run(self.check("CREATE DATABASE")).await??;
        if !self.databases.lock().insert(name.to_string()) {
            return Err(TempDbError::Admin {
                statement: "CREATE DATABASE",
                source: sqlx::Error::Protocol(format!("database {name} already exists")),
            });
        }
        Ok(())
    }

    async fn drop_database(&self, ctx: &OpContext, name: &str) -> Result<()> {
        ctx.run(self.check("DROP DATABASE")).await??;
        self.databases.lock().remove(name);
        Ok(())
    }

    async fn create_user(&self, ctx: &OpContext, username: &str, _password: &str) -> Result<()> {
        ctx.run(self.check("CREATE USER")).await??;
        self.roles.lock().insert(username.to_string());
        Ok(())
    }

    async fn drop_user(&self, ctx: &OpContext, username: &str) -> Result<()> {
        ctx.run(self.check("DROP USER")).await??;
        self.roles.lock().remove(username);
        Ok(())
    }

    async fn grant_all_privileges(
        &self,
        ctx: &OpContext,
        database: &str,
        username: &str,
    ) -> Result<()> {
        ctx.run(self.check("GRANT")).await??;
        self.grants
            .lock()
            .push((database.to_string(), username.to_string()));
        Ok(())
    }
}

/// Memory store whose n-th unit of work fails to commit.
#[derive(Clone)]
struct FlakyCommitStore {
    inner: MemoryStore,
    begun: Arc<AtomicUsize>,
    fail_at: usize,
}

impl FlakyCommitStore {
    fn failing_at(fail_at: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            begun: Arc::new(AtomicUsize::new(0)),
            fail_at,
        }
    }
}

struct FlakyUnitOfWork {
    inner: MemoryUnitOfWork,
    fail: bool,
}

#[async_trait]
impl MetadataStore for FlakyCommitStore {
    type Tx = FlakyUnitOfWork;

    async fn init_schema(&self) -> Result<()> {
        self.inner.init_schema().await
    }

    async fn begin(&self) -> Result<Self::Tx> {
        let n = self.begun.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FlakyUnitOfWork {
            inner: self.inner.begin().await?,
            fail: n == self.fail_at,
        })
    }

    async fn list_live(&self) -> Result<Vec<DatabaseGroup>> {
        self.inner.list_live().await
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<DatabaseGroup>> {
        self.inner.list_expired(now).await
    }
}

#[async_trait]
impl UnitOfWork for FlakyUnitOfWork {
    async fn insert_database(
        &mut self,
        name: &str,
        created_at: DateTime<Utc>,
        expired_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        self.inner.insert_database(name, created_at, expired_at).await
    }

    async fn insert_user(
        &mut self,
        database_id: i64,
        username: &str,
        created_at: DateTime<Utc>,
    ) -> Result<i64> {
        self.inner.insert_user(database_id, username, created_at).await
    }

    async fn select_expired(&mut self, now: DateTime<Utc>) -> Result<Vec<DatabaseGroup>> {
        self.inner.select_expired(now).await
    }

    async fn remove_user(&mut self, id: i64, policy: DeletePolicy, now: DateTime<Utc>) -> Result<()> {
        self.inner.remove_user(id, policy, now).await
    }

    async fn remove_database(
        &mut self,
        id: i64,
        policy: DeletePolicy,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.remove_database(id, policy, now).await
    }

    async fn commit(self) -> Result<()> {
        if self.fail {
            self.inner.rollback().await?;
            return Err(TempDbError::Store(sqlx::Error::Protocol(
                "injected commit failure".into(),
            )));
        }
        self.inner.commit().await
    }

    async fn rollback(self) -> Result<()> {
        self.inner.rollback().await
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn engine(policy: DeletePolicy) -> (Engine<MemoryStore, RecordingAdmin>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start()));
    let engine = Engine::new(MemoryStore::new(), RecordingAdmin::default(), policy)
        .with_clock(clock.clone());
    (engine, clock)
}

fn named(database: &str, username: &str) -> CreateOptions {
    CreateOptions::default()
        .with_database(database)
        .with_username(username)
        .with_password("hunter2")
}

#[tokio::test]
async fn generated_create_provisions_everything() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();

    let db = engine
        .create(&ctx, CreateOptions::default().with_ttl(Duration::from_secs(600)))
        .await
        .unwrap();

    assert!(!db.database.is_empty());
    assert!(!db.username.is_empty());
    assert!(!db.password.is_empty());
    assert_eq!(db.expired_at, Some(start() + chrono::Duration::minutes(10)));

    assert_eq!(engine.store().row_counts().await, (1, 1));
    assert!(engine.admin().databases().contains(&db.database));
    assert!(engine.admin().roles().contains(&db.username));
    assert_eq!(
        engine.admin().grants.lock().as_slice(),
        &[(db.database.clone(), db.username.clone())]
    );
}

#[tokio::test]
async fn duplicate_names_fail_without_partial_state() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();

    engine.create(&ctx, named("acme", "acme_user")).await.unwrap();
    let err = engine
        .create(&ctx, named("acme", "acme_user"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TempDbError::DuplicateResource {
            kind: ResourceKind::Database,
            ..
        }
    ));

    let listed = engine.list(&ctx).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].database, "acme");
    assert_eq!(listed[0].username, "acme_user");
    assert_eq!(engine.store().row_counts().await, (1, 1));
    assert_eq!(engine.admin().databases().len(), 1);
}

#[tokio::test]
async fn colliding_username_undoes_the_new_database() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();

    engine.create(&ctx, named("acme", "shared")).await.unwrap();
    let err = engine
        .create(&ctx, named("globex", "shared"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TempDbError::DuplicateResource {
            kind: ResourceKind::User,
            ..
        }
    ));

    assert!(engine.store().database_by_name("globex").await.is_none());
    assert!(!engine.admin().databases().contains("globex"));
    assert_eq!(engine.store().row_counts().await, (1, 1));
}

#[tokio::test]
async fn failed_create_database_rolls_back_row() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    engine.admin().fail_on("CREATE DATABASE");

    let err = engine
        .create(&OpContext::new(), named("acme", "acme_user"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TempDbError::Provisioning {
            operation: "create database",
            ..
        }
    ));
    assert_eq!(engine.store().row_counts().await, (0, 0));
}

#[tokio::test]
async fn failed_create_user_rolls_back_both_phases() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    engine.admin().fail_on("CREATE USER");

    let err = engine
        .create(&OpContext::new(), named("acme", "acme_user"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TempDbError::Provisioning {
            operation: "create user",
            ..
        }
    ));
    assert_eq!(engine.store().row_counts().await, (0, 0));
    assert!(engine.admin().databases().is_empty());
    assert!(engine.admin().roles().is_empty());
}

#[tokio::test]
async fn failed_grant_drops_the_new_role() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    engine.admin().fail_on("GRANT");

    let err = engine
        .create(&OpContext::new(), named("acme", "acme_user"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TempDbError::Provisioning {
            operation: "grant privileges",
            ..
        }
    ));
    assert!(engine.admin().roles().is_empty());
    assert!(engine.admin().databases().is_empty());
    assert_eq!(engine.store().row_counts().await, (0, 0));
}

#[tokio::test]
async fn failed_commit_after_create_database_drops_it() {
    let engine = Engine::new(
        FlakyCommitStore::failing_at(1),
        RecordingAdmin::default(),
        DeletePolicy::Hard,
    );

    let err = engine
        .create(&OpContext::new(), named("acme", "acme_user"))
        .await
        .unwrap_err();
    assert!(matches!(err, TempDbError::Commit(_)));
    assert!(engine.admin().databases().is_empty());
    assert_eq!(engine.store().inner.row_counts().await, (0, 0));
}

#[tokio::test]
async fn failed_commit_after_create_user_drops_role_and_database() {
    let engine = Engine::new(
        FlakyCommitStore::failing_at(2),
        RecordingAdmin::default(),
        DeletePolicy::Hard,
    );

    let err = engine
        .create(&OpContext::new(), named("acme", "acme_user"))
        .await
        .unwrap_err();
    assert!(matches!(err, TempDbError::Commit(_)));
    assert!(engine.admin().roles().is_empty());
    assert!(engine.admin().databases().is_empty());
    assert_eq!(engine.store().inner.row_counts().await, (0, 0));
}

#[tokio::test]
async fn never_expiring_databases_survive_sweeps() {
    let (engine, clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();

    let db = engine
        .create(&ctx, CreateOptions::default().with_ttl(Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(db.expired_at, None);

    clock.advance(Duration::from_secs(365 * 24 * 3600));
    assert!(engine.delete_expired(&ctx).await.unwrap().is_empty());
    assert_eq!(engine.list(&ctx).await.unwrap().len(), 1);
}

#[tokio::test]
async fn sweep_leaves_unexpired_databases_alone() {
    let (engine, clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();
    engine.create(&ctx, CreateOptions::default()).await.unwrap();

    clock.advance(Duration::from_secs(5 * 60));
    assert!(engine.list_expired(&ctx).await.unwrap().is_empty());
    assert!(engine.delete_expired(&ctx).await.unwrap().is_empty());
    assert_eq!(engine.store().row_counts().await, (1, 1));
}

#[tokio::test]
async fn hard_delete_sweep_reclaims_expired_databases() {
    let (engine, clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();

    let expiring = engine
        .create(&ctx, named("old", "old_user").with_ttl(Duration::from_secs(60)))
        .await
        .unwrap();
    engine
        .create(&ctx, named("fresh", "fresh_user").with_ttl(Duration::from_secs(3600)))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(120));
    let expired = engine.list_expired(&ctx).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].database, "old");

    let reclaimed = engine.delete_expired(&ctx).await.unwrap();
    assert_eq!(
        reclaimed,
        vec![ProvisionedDb {
            database: "old".into(),
            username: "old_user".into(),
            password: String::new(),
            expired_at: expiring.expired_at,
        }]
    );

    assert!(!engine.admin().databases().contains("old"));
    assert!(!engine.admin().roles().contains("old_user"));
    assert!(engine.store().database_by_name("old").await.is_none());
    assert!(engine.store().user_by_name("old_user").await.is_none());
    assert_eq!(engine.store().row_counts().await, (1, 1));
    assert!(engine.delete_expired(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn soft_delete_sweep_keeps_stamped_rows() {
    let (engine, clock) = engine(DeletePolicy::Soft);
    let ctx = OpContext::new();

    engine
        .create(&ctx, named("old", "old_user").with_ttl(Duration::from_secs(60)))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(120));
    let swept_at = clock.now();

    assert_eq!(engine.delete_expired(&ctx).await.unwrap().len(), 1);

    let db = engine.store().database_by_name("old").await.unwrap();
    assert_eq!(db.deleted_at, Some(swept_at));
    let user = engine.store().user_by_name("old_user").await.unwrap();
    assert_eq!(user.deleted_at, Some(swept_at));

    assert!(engine.list(&ctx).await.unwrap().is_empty());
    assert!(engine.delete_expired(&ctx).await.unwrap().is_empty());
    assert_eq!(engine.store().row_counts().await, (1, 1));
}

#[tokio::test]
async fn failing_drop_aborts_the_whole_batch() {
    let (engine, clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();
    for (db, user) in [("a", "a_user"), ("b", "b_user")] {
        engine
            .create(&ctx, named(db, user).with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
    }
    clock.advance(Duration::from_secs(120));
    engine.admin().fail_on("DROP USER");

    let err = engine.delete_expired(&ctx).await.unwrap_err();
    assert!(matches!(
        err,
        TempDbError::Reclamation {
            operation: "drop user",
            ..
        }
    ));
    assert_eq!(engine.store().row_counts().await, (2, 2));
    assert_eq!(engine.list_expired(&ctx).await.unwrap().len(), 2);

    *engine.admin().fail_on.lock() = None;
    assert_eq!(engine.delete_expired(&ctx).await.unwrap().len(), 2);
    assert_eq!(engine.store().row_counts().await, (0, 0));
}

#[tokio::test]
async fn passwords_are_only_returned_by_create() {
    let (engine, clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();
    let created = engine
        .create(&ctx, CreateOptions::default().with_ttl(Duration::from_secs(60)))
        .await
        .unwrap();
    assert!(!created.password.is_empty());

    assert!(engine.list(&ctx).await.unwrap().iter().all(|d| d.password.is_empty()));
    clock.advance(Duration::from_secs(61));
    let reclaimed = engine.delete_expired(&ctx).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert!(reclaimed.iter().all(|d| d.password.is_empty()));
}

#[tokio::test]
async fn memory_backend_init_is_repeatable() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    let ctx = OpContext::new();
    Backend::init(&engine, &ctx).await.unwrap();
    Backend::init(&engine, &ctx).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn deadline_rolls_back_pending_create() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    engine.admin().hang_on("CREATE DATABASE");
    let ctx = OpContext::new().with_timeout(Duration::from_secs(5));

    let err = engine
        .create(&ctx, named("slow", "slow_user"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TempDbError::Context(ContextError::DeadlineExceeded)
    ));
    assert_eq!(engine.store().row_counts().await, (0, 0));
}

#[tokio::test(start_paused = true)]
async fn deadline_during_grant_drops_the_new_role() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    engine.admin().hang_on("GRANT");
    let ctx = OpContext::new().with_timeout(Duration::from_secs(5));

    let err = engine
        .create(&ctx, named("acme", "acme_user"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TempDbError::Context(ContextError::DeadlineExceeded)
    ));
    assert!(engine.admin().roles().is_empty());
    assert!(engine.admin().databases().is_empty());
    assert_eq!(engine.store().row_counts().await, (0, 0));
}

#[tokio::test]
async fn failed_create_user_leaves_existing_role_alone() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    engine.admin().roles.lock().insert("acme_user".to_string());
    engine.admin().fail_on("CREATE USER");

    engine
        .create(&OpContext::new(), named("acme", "acme_user"))
        .await
        .unwrap_err();
    assert!(engine.admin().roles().contains("acme_user"));
    assert!(engine.admin().databases().is_empty());
}

#[tokio::test]
async fn invalid_identifiers_are_rejected_before_any_work() {
    let (engine, _clock) = engine(DeletePolicy::Hard);
    let err = engine
        .create(&OpContext::new(), named(&"x".repeat(64), "u"))
        .await
        .unwrap_err();
    assert!(matches!(err, TempDbError::InvalidIdentifier { .. }));
    assert_eq!(engine.store().row_counts().await, (0, 0));
}
