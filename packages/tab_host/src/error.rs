use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use strand_kit::StrandError;

// =============================================================================
// Host Errors
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("invalid app name {0:?}: use ASCII letters, digits, '-', '.' or '_'")]
    InvalidAppName(String),
    #[error("app already registered: {0}")]
    DuplicateApp(String),
    #[error("unknown app: {0}")]
    UnknownApp(String),
    #[error("unknown session")]
    UnknownSession,
    #[error("unknown tab: {0}")]
    UnknownTab(String),
    #[error("tab closed")]
    TabClosed,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Strand(#[from] StrandError),
}

impl IntoResponse for HostError {
    fn into_response(self) -> Response {
        let status = match &self {
            HostError::InvalidAppName(_) | HostError::DuplicateApp(_) | HostError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            HostError::UnknownApp(_)
            | HostError::UnknownSession
            | HostError::UnknownTab(_)
            | HostError::TabClosed => StatusCode::NOT_FOUND,
            HostError::Strand(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// A poll response could not be handed to its waiting client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("poll client disconnected before delivery")]
    ReceiverGone,
}
