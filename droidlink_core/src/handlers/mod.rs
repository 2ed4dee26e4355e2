//! Domain handlers for the JSON API
//!
//! One module per `/api/<domain>` namespace. Handlers receive the
//! parsed request plus the router's auth verdict and return either a
//! [`Response`] or an [`ApiError`] that the router folds into the
//! uniform error envelope.

pub mod apps;
pub mod contacts;
pub mod device;
pub mod files;
pub mod orchestrator;
pub mod peer;
pub mod ping;
pub mod shell;
pub mod sms;

use crate::auth::AuthFailure;
use crate::error::AgentError;
use crate::http::{Request, Response};
use crate::providers::ProviderError;

/// Handler failure, carrying the HTTP status it maps to
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Unavailable(String),
    NotImplemented(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::Unauthorized(_) => 401,
            ApiError::Forbidden(_) => 403,
            ApiError::NotFound(_) => 404,
            ApiError::Unavailable(_) => 503,
            ApiError::NotImplemented(_) => 501,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::NotFound(m)
            | ApiError::Unavailable(m)
            | ApiError::NotImplemented(m)
            | ApiError::Internal(m) => m,
        }
    }

    pub fn into_response(self) -> Response {
        Response::error(self.status(), self.message())
    }
}

impl From<AuthFailure> for ApiError {
    fn from(failure: AuthFailure) -> Self {
        match failure.status() {
            400 => ApiError::BadRequest(failure.to_string()),
            401 => ApiError::Unauthorized(failure.to_string()),
            _ => ApiError::Forbidden(failure.to_string()),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::Unsupported => {
                ApiError::NotImplemented("unsupported on this platform".to_string())
            }
            ProviderError::NotFound(m) => ApiError::NotFound(m),
            ProviderError::Denied(m) => ApiError::Forbidden(m),
            ProviderError::Invalid(m) => ApiError::BadRequest(m),
            ProviderError::Failed(m) => ApiError::Internal(m),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => ApiError::NotFound("no such file".to_string()),
            std::io::ErrorKind::PermissionDenied => {
                ApiError::Forbidden("permission denied".to_string())
            }
            _ => ApiError::Internal(error.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(error: AgentError) -> Self {
        match error {
            AgentError::NotFound(m) => ApiError::NotFound(m),
            AgentError::Io(e) => e.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type HandlerResult = std::result::Result<Response, ApiError>;

/// Extract a required query parameter
pub fn require_param<'a>(request: &'a Request, name: &str) -> Result<&'a str, ApiError> {
    request
        .query_param(name)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("missing parameter '{}'", name)))
}

/// Parse the request body as JSON
pub fn json_body<T: serde::de::DeserializeOwned>(request: &Request) -> Result<T, ApiError> {
    if request.body.is_empty() {
        return Err(ApiError::BadRequest("missing request body".to_string()));
    }
    request
        .json()
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

/// The plain success envelope
pub fn ok() -> Response {
    Response::ok_json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_statuses() {
        assert_eq!(ApiError::BadRequest("x".into()).status(), 400);
        assert_eq!(ApiError::Unauthorized("x".into()).status(), 401);
        assert_eq!(ApiError::Forbidden("x".into()).status(), 403);
        assert_eq!(ApiError::NotFound("x".into()).status(), 404);
        assert_eq!(ApiError::Unavailable("x".into()).status(), 503);
        assert_eq!(ApiError::NotImplemented("x".into()).status(), 501);
        assert_eq!(ApiError::Internal("x".into()).status(), 500);
    }

    #[test]
    fn test_provider_error_mapping() {
        assert_eq!(ApiError::from(ProviderError::Unsupported).status(), 501);
        assert_eq!(
            ApiError::from(ProviderError::NotFound("x".into())).status(),
            404
        );
        assert_eq!(
            ApiError::from(ProviderError::Denied("x".into())).status(),
            403
        );
        assert_eq!(
            ApiError::from(ProviderError::Invalid("x".into())).status(),
            400
        );
    }

    #[test]
    fn test_io_error_mapping() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(ApiError::from(err).status(), 404);

        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        assert_eq!(ApiError::from(err).status(), 403);
    }

    #[test]
    fn test_require_param() {
        let request = Request::test("GET", "/api/files/list?path=/sdcard");
        assert_eq!(require_param(&request, "path").unwrap(), "/sdcard");
        assert!(require_param(&request, "pattern").is_err());
    }

    #[test]
    fn test_json_body_rejects_empty() {
        let request = Request::test("POST", "/api/shell/exec");
        let result: Result<serde_json::Value, _> = json_body(&request);
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
