use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::info;

use crate::api::jsonapi::{self, Document};
use crate::error::TempDbError;
use crate::middleware::create_request::CreatePreprocess;
use crate::router::TempDbState;
use crate::types::ProvisionedDb;

fn jsonapi_response<T: Serialize>(status: StatusCode, data: T) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, jsonapi::CONTENT_TYPE)],
        Json(Document { data }),
    )
        .into_response()
}

fn db_list(dbs: Vec<ProvisionedDb>) -> Response {
    let data: Vec<_> = dbs.into_iter().map(jsonapi::db_resource).collect();
    jsonapi_response(StatusCode::OK, data)
}

/// GET /api/v1/databases -> registered backend names.
pub async fn list_backends_handler(State(state): State<TempDbState>) -> Response {
    let data: Vec<_> = state
        .registry
        .names()
        .into_iter()
        .map(jsonapi::backend_resource)
        .collect();
    jsonapi_response(StatusCode::OK, data)
}

/// POST /api/v1/databases/{name}/dbs -> provision one database and credential.
pub async fn create_db_handler(
    State(state): State<TempDbState>,
    CreatePreprocess(name, request): CreatePreprocess,
) -> Result<Response, TempDbError> {
    let backend = state.registry.require(&name)?;
    let ctx = state.request_context();
    let db = backend
        .create(&ctx, request.into_options(state.default_ttl))
        .await?;
    info!(backend = %name, database = %db.database, username = %db.username, "database handed out");
    Ok(jsonapi_response(StatusCode::CREATED, jsonapi::db_resource(db)))
}

/// GET /api/v1/databases/{name}/dbs -> live credentials, passwords blanked.
pub async fn list_dbs_handler(
    State(state): State<TempDbState>,
    Path(name): Path<String>,
) -> Result<Response, TempDbError> {
    let backend = state.registry.require(&name)?;
    let dbs = backend.list(&state.request_context()).await?;
    Ok(db_list(dbs))
}

/// GET /api/v1/databases/{name}/dbs/expired -> expired, not yet reclaimed.
pub async fn list_expired_handler(
    State(state): State<TempDbState>,
    Path(name): Path<String>,
) -> Result<Response, TempDbError> {
    let backend = state.registry.require(&name)?;
    let dbs = backend.list_expired(&state.request_context()).await?;
    Ok(db_list(dbs))
}

/// DELETE /api/v1/databases/{name}/dbs/expired -> sweep now, return what was reclaimed.
pub async fn delete_expired_handler(
    State(state): State<TempDbState>,
    Path(name): Path<String>,
) -> Result<Response, TempDbError> {
    let backend = state.registry.require(&name)?;
    let reclaimed = backend.delete_expired(&state.request_context()).await?;
    info!(backend = %name, count = reclaimed.len(), "expired databases reclaimed on request");
    Ok(db_list(reclaimed))
}
