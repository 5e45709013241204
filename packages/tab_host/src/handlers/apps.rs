use axum::{
    Extension,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderValue, Method, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use super::{CurrentSession, HostState};
use crate::app::{WebRequest, WebResponse};
use crate::error::HostError;

impl IntoResponse for WebResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        match HeaderValue::from_str(&self.content_type) {
            Ok(value) => {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            Err(e) => warn!("app returned a bad content type: {}", e),
        }
        response
    }
}

/// Forward `/{app}` and `/{app}/{*rest}` to the named app
pub async fn app_request(
    State(state): State<HostState>,
    Path(params): Path<HashMap<String, String>>,
    Query(query): Query<BTreeMap<String, String>>,
    Extension(current): Extension<CurrentSession>,
    method: Method,
    body: Bytes,
) -> Result<Response, HostError> {
    let app_name = params.get("app").cloned().unwrap_or_default();
    let Some(app) = state.apps.get_app(&app_name).await? else {
        return Err(HostError::UnknownApp(app_name));
    };
    let path: Vec<String> = params
        .get("rest")
        .map(|rest| {
            rest.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    debug!(app = %app_name, %method, ?path, "forwarding web request");

    let response = app
        .serve_web_request(WebRequest {
            method,
            path,
            query,
            body,
            session_key: current.session.key().to_string(),
            user_id: current.user_id,
        })
        .await?;
    Ok(response.into_response())
}
