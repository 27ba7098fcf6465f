//! JSON:API documents returned by the HTTP layer.

use crate::types::ProvisionedDb;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

pub const CONTENT_TYPE: &str = "application/vnd.api+json";

#[derive(Debug, Serialize)]
pub struct Document<T> {
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct Resource<A> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: String,
    pub attributes: A,
}

#[derive(Debug, Serialize)]
pub struct BackendAttributes {
    pub name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAttributes {
    pub database: String,
    pub username: String,
    pub password: String,
    pub expired_at: Option<String>,
}

pub fn backend_resource(name: String) -> Resource<BackendAttributes> {
    Resource {
        kind: "databases",
        id: name.clone(),
        attributes: BackendAttributes { name },
    }
}

pub fn db_resource(db: ProvisionedDb) -> Resource<DbAttributes> {
    Resource {
        kind: "dbs",
        id: format!("{}_{}", db.database, db.username),
        attributes: DbAttributes {
            database: db.database,
            username: db.username,
            password: db.password,
            expired_at: db.expired_at.as_ref().map(format_timestamp),
        },
    }
}

/// RFC 3339 in UTC with millisecond precision, e.g. `2024-05-01T12:10:00.000Z`.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
