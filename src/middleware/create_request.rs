use axum::{
    RequestExt,
    body::Bytes,
    extract::{FromRequest, Path, Request},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::time::Duration;

use crate::error::TempDbError;
use crate::types::CreateOptions;

/// Optional body of `POST /databases/{name}/dbs`. Every field may be left out.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CreateDbRequest {
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Humantime duration; `"0s"` never expires.
    #[serde(with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

impl CreateDbRequest {
    pub fn into_options(self, default_ttl: Duration) -> CreateOptions {
        CreateOptions {
            database: self.database,
            username: self.username,
            password: self.password,
            ttl: self.ttl.unwrap_or(default_ttl),
            ..Default::default()
        }
    }
}

/// Backend name from the path plus the parsed create request. An empty body
/// is the same as `{}`.
pub struct CreatePreprocess(pub String, pub CreateDbRequest);

impl<S> FromRequest<S> for CreatePreprocess
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(mut req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let Path(name) = match req.extract_parts::<Path<String>>().await {
            Ok(p) => p,
            Err(rejection) => return Err(rejection.into_response()),
        };

        let body = match Bytes::from_request(req, &()).await {
            Ok(b) => b,
            Err(rejection) => return Err(rejection.into_response()),
        };

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(CreatePreprocess(name, CreateDbRequest::default()));
        }

        match serde_json::from_slice::<CreateDbRequest>(&body) {
            Ok(request) => Ok(CreatePreprocess(name, request)),
            Err(e) => Err(TempDbError::InvalidRequest(e.to_string()).into_response()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ttl_falls_back_to_default() {
        let req: CreateDbRequest = serde_json::from_str(r#"{"database":"acme"}"#).unwrap();
        let opts = req.into_options(Duration::from_secs(42));
        assert_eq!(opts.database.as_deref(), Some("acme"));
        assert_eq!(opts.username, None);
        assert_eq!(opts.ttl, Duration::from_secs(42));
    }

    #[test]
    fn ttl_is_parsed_as_humantime() {
        let req: CreateDbRequest = serde_json::from_str(r#"{"ttl":"1h 30m"}"#).unwrap();
        assert_eq!(req.ttl, Some(Duration::from_secs(90 * 60)));
        let req: CreateDbRequest = serde_json::from_str(r#"{"ttl":"0s"}"#).unwrap();
        assert!(req.into_options(Duration::from_secs(600)).ttl.is_zero());
        assert!(serde_json::from_str::<CreateDbRequest>(r#"{"ttl":"soon"}"#).is_err());
    }
}
