use crate::error::{Result, TempDbError};
use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default lifetime of a provisioned database.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// Postgres truncates identifiers longer than NAMEDATALEN - 1 bytes.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Credential handed back to callers. `password` is only non-empty in the
/// result of `create`; it is never stored.
#[derive(Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProvisionedDb {
    pub database: String,
    pub username: String,
    pub password: String,
    pub expired_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for ProvisionedDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionedDb")
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("expired_at", &self.expired_at)
            .finish()
    }
}

pub type Generator = Arc<dyn Fn() -> String + Send + Sync>;

/// Name and secret generators used when a `create` call leaves a field unset.
#[derive(Clone)]
pub struct Generators {
    pub database_name: Generator,
    pub username: Generator,
    pub password: Generator,
}

impl Default for Generators {
    fn default() -> Self {
        Self {
            database_name: Arc::new(generate_database_name),
            username: Arc::new(generate_username),
            password: Arc::new(generate_password),
        }
    }
}

impl fmt::Debug for Generators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Generators { .. }")
    }
}

pub fn generate_database_name() -> String {
    format!("db_{}", Uuid::new_v4().simple())
}

pub fn generate_username() -> String {
    format!("user_{}", Uuid::new_v4().simple())
}

pub fn generate_password() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Parameters of one `create` call.
///
/// A `ttl` of zero provisions a database that never expires.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ttl: Duration,
    pub generators: Generators,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            database: None,
            username: None,
            password: None,
            ttl: DEFAULT_TTL,
            generators: Generators::default(),
        }
    }
}

/// `CreateOptions` with every field decided.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCreate {
    pub database: String,
    pub username: String,
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
}

impl CreateOptions {
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Fill unset fields from the generators and compute the expiry.
    pub fn resolve(self, now: DateTime<Utc>) -> Result<ResolvedCreate> {
        let gens = self.generators;
        let database = self
            .database
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| (gens.database_name)());
        let username = self
            .username
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| (gens.username)());
        let password = self.password.unwrap_or_else(|| (gens.password)());

        validate_identifier(&database)?;
        validate_identifier(&username)?;

        let expired_at = if self.ttl.is_zero() {
            None
        } else {
            let too_large = || TempDbError::InvalidConfig(format!("ttl {:?} is too large", self.ttl));
            let ttl = chrono::Duration::from_std(self.ttl).map_err(|_| too_large())?;
            Some(now.checked_add_signed(ttl).ok_or_else(too_large)?)
        };

        Ok(ResolvedCreate {
            database,
            username,
            password,
            created_at: now,
            expired_at,
        })
    }
}

/// Reject names Postgres would refuse or silently truncate.
pub fn validate_identifier(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() > MAX_IDENTIFIER_LEN {
        "longer than 63 bytes"
    } else if name.contains('\0') {
        "contains a NUL byte"
    } else {
        return Ok(());
    };
    Err(TempDbError::InvalidIdentifier {
        name: name.to_string(),
        reason,
    })
}

/// Time source for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        // TIMESTAMPTZ keeps microseconds
        Utc::now().trunc_subsecs(6)
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start.trunc_subsecs(6)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
