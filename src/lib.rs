pub mod admin;
pub mod api;
pub mod backend;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod registry;
pub mod router;
pub mod service;
pub mod types;

pub use backend::Backend;
pub use context::OpContext;
pub use engine::{Engine, PostgresBackend};
pub use error::{Result, TempDbError};
pub use registry::Registry;
pub use types::{CreateOptions, ProvisionedDb};
