//! Metadata store: bookkeeping of provisioned databases and users.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows and the grouped read model
//! - `schema.rs`: SQL DDL for initializing the bookkeeping tables (Postgres)
//! - `store.rs`: `MetadataStore` / `UnitOfWork` traits the engine is written against
//! - `postgres.rs`: sqlx implementation over the management database
//! - `memory.rs`: in-process implementation with the same uniqueness rules
//! - `txn.rs`: commit-or-rollback helper for units of work

pub mod memory;
pub mod models;
pub mod postgres;
pub mod schema;
pub mod store;
pub mod txn;

pub use memory::MemoryStore;
pub use models::{DatabaseGroup, DatabaseRecord, DeletePolicy, UserRecord, UserRef};
pub use postgres::{PgMetadataStore, PgUnitOfWork};
pub use schema::POSTGRES_INIT;
pub use store::{MetadataStore, UnitOfWork};
pub use txn::transaction;
