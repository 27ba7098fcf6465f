//! SQL DDL for initializing the bookkeeping tables in the management database.

/// Postgres schema with:
/// - `databases.name` UNIQUE, matching the real database name
/// - `users.username` UNIQUE, `users.database_id` referencing `databases.id`
/// - nullable `expired_at` (never expires) and `deleted_at` (soft delete)
pub const POSTGRES_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS databases (
    id BIGSERIAL,
    name VARCHAR(255) NOT NULL,
    expired_at TIMESTAMP WITH TIME ZONE,
    created_at TIMESTAMP WITH TIME ZONE NOT NULL,
    deleted_at TIMESTAMP WITH TIME ZONE,

    CONSTRAINT pk__databases__id PRIMARY KEY (id),
    CONSTRAINT ux__databases__name UNIQUE (name)
);

CREATE TABLE IF NOT EXISTS users (
    id BIGSERIAL,
    username VARCHAR(255) NOT NULL,
    database_id BIGINT NOT NULL,
    created_at TIMESTAMP WITH TIME ZONE NOT NULL,
    deleted_at TIMESTAMP WITH TIME ZONE,

    CONSTRAINT pk__users__id PRIMARY KEY (id),
    CONSTRAINT ux__users__username UNIQUE (username),
    CONSTRAINT fk__users__database_id FOREIGN KEY (database_id) REFERENCES databases(id)
);

CREATE INDEX IF NOT EXISTS ix__databases__expired_at ON databases(expired_at) WHERE deleted_at IS NULL;

CREATE INDEX IF NOT EXISTS ix__users__database_id ON users(database_id);
"#;

/// Split the bundled DDL into single statements (sqlx prepares one at a time).
pub fn statements(ddl: &str) -> impl Iterator<Item = &str> {
    ddl.split(';').map(str::trim).filter(|s| !s.is_empty())
}
