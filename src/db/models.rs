use crate::types::ProvisionedDb;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRecord {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub database_id: i64,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub id: i64,
    pub username: String,
}

/// One database together with the users that belong to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseGroup {
    pub id: i64,
    pub name: String,
    pub expired_at: Option<DateTime<Utc>>,
    pub users: Vec<UserRef>,
}

/// Row of the `databases LEFT JOIN users` read.
#[derive(Debug, Clone, FromRow)]
pub struct JoinedRow {
    pub database_id: i64,
    pub database_name: String,
    pub expired_at: Option<DateTime<Utc>>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
}

/// How reclaimed rows leave the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletePolicy {
    #[default]
    Hard,
    /// Keep the row, stamp `deleted_at`.
    Soft,
}

impl DeletePolicy {
    pub fn from_soft_delete(soft_delete: bool) -> Self {
        if soft_delete {
            DeletePolicy::Soft
        } else {
            DeletePolicy::Hard
        }
    }
}

/// Group joined rows by database id. A database without users yields a group
/// with an empty user list.
pub fn group_rows(rows: impl IntoIterator<Item = JoinedRow>) -> Vec<DatabaseGroup> {
    let mut groups: HashMap<i64, DatabaseGroup> = HashMap::new();
    for row in rows {
        let group = groups.entry(row.database_id).or_insert_with(|| DatabaseGroup {
            id: row.database_id,
            name: row.database_name.clone(),
            expired_at: row.expired_at,
            users: Vec::new(),
        });
        if let (Some(id), Some(username)) = (row.user_id, row.username) {
            group.users.push(UserRef { id, username });
        }
    }
    let mut groups: Vec<DatabaseGroup> = groups.into_values().collect();
    groups.sort_by_key(|g| g.id);
    groups
}

impl DatabaseGroup {
    /// Flatten into caller-facing credentials with the password blanked. A
    /// group without users still yields one entry so the database is visible.
    pub fn into_credentials(self) -> Vec<ProvisionedDb> {
        if self.users.is_empty() {
            return vec![ProvisionedDb {
                database: self.name,
                username: String::new(),
                password: String::new(),
                expired_at: self.expired_at,
            }];
        }
        let DatabaseGroup {
            name,
            expired_at,
            users,
            ..
        } = self;
        users
            .into_iter()
            .map(|u| ProvisionedDb {
                database: name.clone(),
                username: u.username,
                password: String::new(),
                expired_at,
            })
            .collect()
    }
}
