pub mod apps;
pub mod health;
pub mod tabs;

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderValue, header::SET_COOKIE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
};
use axum_extra::headers::{Cookie, HeaderMapExt};
use std::sync::Arc;
use tracing::warn;

use crate::apps_state::{AppsState, AppsStateOptions};
use crate::config::HostConfig;
use crate::session::SessionRecord;
use crate::tab_status::TabStatusBoard;

pub use apps::app_request;
pub use health::{health_handler, health_live_handler, metrics_handler, tab_status_handler};
pub use tabs::{create_tab, delete_tab, poll_tab, send_to_tab};

/// Shared state behind every route
#[derive(Clone)]
pub struct HostState {
    pub apps: AppsState,
    pub board: Arc<TabStatusBoard>,
    pub config: Arc<HostConfig>,
}

impl HostState {
    /// Wire an [`AppsState`] to `config`, with the status board listening
    pub fn new(config: HostConfig, options: AppsStateOptions) -> Self {
        let board = Arc::new(TabStatusBoard::new());
        let apps = AppsState::new(AppsStateOptions {
            policy: config.policy,
            queue_budget: config.queue_budget,
            status_listener: Some(board.clone()),
            ..options
        });
        Self {
            apps,
            board,
            config: Arc::new(config),
        }
    }
}

/// The cookie session of the current request, set by [`session_middleware`]
#[derive(Clone, Debug)]
pub struct CurrentSession {
    pub session: SessionRecord,
    /// From the user cookie; empty when absent
    pub user_id: String,
}

pub fn build_router(state: HostState) -> Router {
    let client_routes = Router::new()
        .route("/poll/{session}", post(create_tab))
        .route("/poll/{session}/{tab}", get(poll_tab).delete(delete_tab))
        .route("/send/{session}/{tab}", post(send_to_tab))
        .route("/{app}", any(app_request))
        .route("/{app}/{*rest}", any(app_request))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session_middleware,
        ));

    Router::new()
        // Health endpoints
        .route("/health", get(health_handler))
        .route("/health/live", get(health_live_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status/tabs", get(tab_status_handler))
        .merge(client_routes)
        .with_state(state)
}

/// Resolve or mint the session cookie and echo it back on the response
pub async fn session_middleware(
    State(state): State<HostState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let cookies = request.headers().typed_get::<Cookie>();
    let user_id = cookies
        .as_ref()
        .and_then(|c| c.get(&state.config.user_cookie_name))
        .unwrap_or_default()
        .to_string();
    let presented = cookies.as_ref().and_then(|c| c.get(&state.config.cookie_name));

    let session = match state.apps.find_or_create_session(presented).await {
        Ok(session) => session,
        Err(e) => return e.into_response(),
    };
    let set_cookie = format!("{}={}; Path=/", state.config.cookie_name, session.key());
    request
        .extensions_mut()
        .insert(CurrentSession { session, user_id });

    let mut response = next.run(request).await;
    match HeaderValue::from_str(&set_cookie) {
        Ok(value) => {
            response.headers_mut().append(SET_COOKIE, value);
        }
        Err(e) => warn!("cannot encode session cookie: {}", e),
    }
    response
}
