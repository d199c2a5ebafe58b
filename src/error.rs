use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataApiError {
    #[error("api-key header is required")]
    MissingCredential,

    #[error("Invalid api-key")]
    InvalidCredential,

    #[error("You do not have permission to write")]
    Unauthorized,

    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Invalid {0}: {1}")]
    InvalidField(&'static str, String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Cluster {0} not found")]
    UnknownCluster(String),

    #[error("Unknown action")]
    UnknownAction(String),

    #[error("Malformed extended JSON value: {0}")]
    MalformedExtendedValue(String),

    #[error("{0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataApiError {
    /// HTTP status used when this error is returned to a caller.
    ///
    /// Credential problems are 401, everything a request can trigger
    /// otherwise is 400. Unknown actions are 400 as well.
    pub fn status(&self) -> StatusCode {
        match self {
            DataApiError::MissingCredential
            | DataApiError::InvalidCredential
            | DataApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            DataApiError::Config(_) | DataApiError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<mongodb::error::Error> for DataApiError {
    fn from(e: mongodb::error::Error) -> Self {
        DataApiError::Backend(e.to_string())
    }
}

impl From<bson::ser::Error> for DataApiError {
    fn from(e: bson::ser::Error) -> Self {
        DataApiError::Backend(e.to_string())
    }
}

impl IntoResponse for DataApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, DataApiError>;
