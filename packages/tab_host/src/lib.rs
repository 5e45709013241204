//! Tab Host - long-poll event delivery for browser tabs
//!
//! Browsers open *tabs* against registered [`App`]s inside a cookie-keyed
//! *session*. Each tab buffers outbound events in an [`EventQueue`] until
//! the browser's next long-poll arrives, and hands inbound JSON messages to
//! its app. Sessions, tabs and apps each run on their own
//! [`strand_kit::Strand`], so no two pieces of logic for the same client
//! ever run at once, and a shared [`strand_kit::TimerThread`] expires idle
//! tabs and over-long polls.
//!
//! # Architecture
//!
//! ```text
//! HTTP (axum) --> AppsState (registry strand) --> SessionRecord
//!                                                   |
//!                                                   v
//!                   App strand <-- AppTabScheduler <-- ServerTab (tab strand)
//!                                                   |      |
//!                                         EventQueue    TimerCallback
//! ```
//!
//! The `tab-host` binary serves the [`handlers`] router with the
//! [`echo::EchoApp`] registered.

pub mod app;
pub mod apps_state;
pub mod config;
pub mod echo;
pub mod error;
pub mod event_queue;
pub mod handlers;
pub mod metrics;
pub mod server_tab;
pub mod session;
pub mod tab_status;
pub mod users;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use app::{App, AppRecord, AppTab, CookieAttributes, TabProxy, WebRequest, WebResponse};
pub use apps_state::{AppsState, AppsStateOptions};
pub use config::{FileConfig, HostConfig, load_config};
pub use error::{DeliveryError, HostError};
pub use event_queue::{EventQueue, PollId, PollRequest, PollResponse};
pub use handlers::{HostState, build_router};
pub use metrics::HostMetrics;
pub use server_tab::{PollGuard, ServerTab, TimeoutPolicy};
pub use session::SessionRecord;
pub use tab_status::{TabStatus, TabStatusBoard, TabStatusListener, TabStatusQueue};
pub use users::{User, UserDirectory};
