//! Demonstration app: greets each tab and echoes whatever the client sends

use serde_json::{Value, json};
use tracing::debug;

use crate::app::{App, AppTab, TabProxy, WebRequest, WebResponse};
use crate::users::User;

pub const ECHO_APP_NAME: &str = "echo";

#[derive(Debug, Default)]
pub struct EchoApp;

struct EchoTab {
    tab: TabProxy,
    received: u64,
}

fn describe(user: &Option<User>) -> Value {
    match user {
        Some(user) => json!({ "id": user.id, "name": user.display_name }),
        None => Value::Null,
    }
}

impl App for EchoApp {
    fn create_tab(&self, tab: TabProxy, user: Option<User>) -> Box<dyn AppTab> {
        tab.send_event(
            "welcome",
            json!({ "tabId": tab.tab_id(), "user": describe(&user) }),
        );
        Box::new(EchoTab { tab, received: 0 })
    }

    /// Describe the request back as JSON
    fn serve_web_request(&self, request: WebRequest) -> WebResponse {
        WebResponse::json(&json!({
            "method": request.method.as_str(),
            "path": request.path,
            "query": request.query,
            "session": request.session_key,
            "user": request.user_id,
            "body": String::from_utf8_lossy(&request.body),
        }))
    }
}

impl AppTab for EchoTab {
    fn change_user(&mut self, user: Option<User>) {
        self.tab.send_event("user", describe(&user));
    }

    fn receive(&mut self, value: Value) {
        self.received += 1;
        self.tab
            .send_event("echo", json!({ "seq": self.received, "value": value }));
    }

    fn tab_closed(&mut self) {
        debug!(
            tab = %self.tab.tab_id(),
            messages = self.received,
            "echo tab closed"
        );
    }
}
