use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{
        StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{CurrentSession, HostState};
use crate::error::HostError;
use crate::event_queue::PollRequest;
use crate::server_tab::ServerTab;

#[derive(Debug, Deserialize)]
pub struct CreateTabParams {
    pub appname: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTabResponse {
    pub tab_url: String,
    pub tab_id: String,
}

async fn find_tab(state: &HostState, session_key: &str, tab_id: &str) -> Result<ServerTab, HostError> {
    state
        .apps
        .get_tab(session_key, tab_id)
        .await?
        .ok_or_else(|| HostError::UnknownTab(tab_id.to_string()))
}

/// Open a tab of `?appname=` in the session named by the path
pub async fn create_tab(
    State(state): State<HostState>,
    Path(session_key): Path<String>,
    Query(params): Query<CreateTabParams>,
    Extension(current): Extension<CurrentSession>,
) -> Result<Response, HostError> {
    let Some(app_name) = params.appname.filter(|name| !name.is_empty()) else {
        state.apps.metrics().bad_request();
        return Err(HostError::BadRequest("missing appname".to_string()));
    };
    let tab = state
        .apps
        .create_tab(&session_key, &app_name, &current.user_id)
        .await?;
    let body = CreateTabResponse {
        tab_url: format!("/poll/{}/{}", session_key, tab.tab_id()),
        tab_id: tab.tab_id().to_string(),
    };
    Ok(([(CACHE_CONTROL, "no-cache")], Json(body)).into_response())
}

/// Long-poll for the tab's next batch of events
pub async fn poll_tab(
    State(state): State<HostState>,
    Path((session_key, tab_id)): Path<(String, String)>,
) -> Result<Response, HostError> {
    let tab = find_tab(&state, &session_key, &tab_id).await?;
    state.apps.metrics().poll_started();

    let (request, response) = PollRequest::new();
    // dropping the guard (client gone) detaches the poll from the tab
    let guard = tab.serve(request);
    let payload = response.wait().await;
    guard.disarm();

    let payload = payload.ok_or(HostError::TabClosed)?;
    Ok((
        [(CACHE_CONTROL, "no-cache"), (CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response())
}

pub async fn delete_tab(
    State(state): State<HostState>,
    Path((session_key, tab_id)): Path<(String, String)>,
) -> Result<StatusCode, HostError> {
    state.apps.close_tab(&session_key, &tab_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Deliver one JSON value from the client to the tab's app
pub async fn send_to_tab(
    State(state): State<HostState>,
    Path((session_key, tab_id)): Path<(String, String)>,
    body: Bytes,
) -> Result<StatusCode, HostError> {
    let tab = find_tab(&state, &session_key, &tab_id).await?;
    let value: Value = serde_json::from_slice(body.trim_ascii()).map_err(|e| {
        debug!(tab = %tab_id, "rejecting malformed message: {}", e);
        state.apps.metrics().bad_request();
        HostError::BadRequest(format!("invalid JSON: {e}"))
    })?;
    state.apps.metrics().message_received();
    tab.receive(value);
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::handlers::build_router;
    use crate::test_helpers::{AppEvent, RecordingApp, settle, test_options};
    use crate::users::User;
    use axum::{
        Router,
        body::Body,
        http::{Request, header::SET_COOKIE},
    };
    use serde_json::json;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn test_router() -> (Router, HostState, Arc<RecordingApp>, String) {
        let state = HostState::new(HostConfig::default(), test_options());
        let app = RecordingApp::new();
        state.apps.add_app("recording", app.clone()).await.unwrap();
        let session = state.apps.find_or_create_session(None).await.unwrap();
        (
            build_router(state.clone()),
            state,
            app,
            session.key().to_string(),
        )
    }

    fn request(method: &str, uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body)
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(body.to_vec()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_tab_returns_tab_url() {
        let (router, _state, app, key) = test_router().await;
        let resp = router
            .oneshot(request(
                "POST",
                &format!("/poll/{key}?appname=recording"),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()
                .get(SET_COOKIE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("tabhost_session=")
        );

        let created: CreateTabResponse = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(created.tab_url, format!("/poll/{key}/1"));
        assert_eq!(created.tab_id, "1");

        settle().await;
        assert_eq!(
            app.events()[0],
            AppEvent::Created {
                tab_id: "1".into(),
                user: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_tab_uses_user_cookie() {
        let (router, state, app, key) = test_router().await;
        state.apps.users().set_user(User::new("ada", "Ada Lovelace"));

        let resp = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/poll/{key}?appname=recording"))
                    .header("cookie", "tabhost_user=ada")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        settle().await;
        assert_eq!(
            app.events()[0],
            AppEvent::Created {
                tab_id: "1".into(),
                user: Some("ada".into())
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_known_session_cookie_is_echoed() {
        let (router, _state, _app, key) = test_router().await;
        let resp = router
            .oneshot(
                Request::builder()
                    .uri(format!("/poll/{key}/99"))
                    .header("cookie", format!("tabhost_session={key}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get(SET_COOKIE).unwrap(),
            &format!("tabhost_session={key}; Path=/")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_tab_errors() {
        let (router, _state, _app, key) = test_router().await;

        let resp = router
            .clone()
            .oneshot(request("POST", &format!("/poll/{key}"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/poll/{key}?appname=missing"),
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router
            .oneshot(request(
                "POST",
                "/poll/AAAAAAAAAAAAAAAA?appname=recording",
                Body::empty(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = serde_json::from_str(&body_string(resp).await).unwrap();
        assert_eq!(body["error"], "unknown session");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_delivers_queued_events() {
        let (router, state, app, key) = test_router().await;
        state.apps.create_tab(&key, "recording", "").await.unwrap();
        settle().await;

        let proxy = app.proxy("1").unwrap();
        proxy.send(json!({"foo": "bar"}));
        proxy.send_event("notice", json!(2));

        let resp = router
            .oneshot(request("GET", &format!("/poll/{key}/1"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(resp.headers().get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(
            body_string(resp).await,
            r#"[{"type":"event","value":{"foo":"bar"}},{"type":"notice","value":2}]"#
        );
        assert_eq!(state.apps.metrics().snapshot().polls.started, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_with_empty_array() {
        let (router, state, _app, key) = test_router().await;
        state.apps.create_tab(&key, "recording", "").await.unwrap();

        let resp = router
            .oneshot(request("GET", &format!("/poll/{key}/1"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "[]");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_on_tab_closed_while_waiting_is_not_found() {
        let (router, state, _app, key) = test_router().await;
        state.apps.create_tab(&key, "recording", "").await.unwrap();

        let pending = tokio::spawn(
            router.oneshot(request("GET", &format!("/poll/{key}/1"), Body::empty())),
        );
        settle().await;
        state.apps.close_tab(&key, "1").await.unwrap();

        let resp = pending.await.unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_reaches_app() {
        let (router, state, app, key) = test_router().await;
        state.apps.create_tab(&key, "recording", "").await.unwrap();

        let resp = router
            .oneshot(request(
                "POST",
                &format!("/send/{key}/1"),
                Body::from(" {\"text\": \"hi\"}\n"),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        settle().await;
        assert!(app.events().contains(&AppEvent::Received {
            tab_id: "1".into(),
            value: json!({"text": "hi"}),
        }));
        assert_eq!(state.apps.metrics().snapshot().messages.received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_rejects_bad_json_and_unknown_tabs() {
        let (router, state, app, key) = test_router().await;
        state.apps.create_tab(&key, "recording", "").await.unwrap();

        let resp = router
            .clone()
            .oneshot(request("POST", &format!("/send/{key}/1"), Body::from("{nope")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = router
            .oneshot(request("POST", &format!("/send/{key}/7"), Body::from("{nope")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        settle().await;
        assert!(
            !app.events()
                .iter()
                .any(|e| matches!(e, AppEvent::Received { .. }))
        );
        assert_eq!(state.apps.metrics().snapshot().errors.bad_requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_closes_tab() {
        let (router, state, app, key) = test_router().await;
        state.apps.create_tab(&key, "recording", "").await.unwrap();

        let resp = router
            .clone()
            .oneshot(request("DELETE", &format!("/poll/{key}/1"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = router
            .clone()
            .oneshot(request("DELETE", &format!("/poll/{key}/1"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = router
            .oneshot(request("GET", &format!("/poll/{key}/1"), Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        settle().await;
        assert_eq!(app.closed_count("1"), 1);
    }
}
