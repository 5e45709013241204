//! Serialized execution over the shared tokio pool
//!
//! A [`Strand`] owns one drain task. Closures pushed through
//! [`Strand::schedule_exclusive`] run on that task one after another, in the
//! order they were submitted, so state owned by a strand needs no further
//! coordination as long as it is only touched from inside scheduled actions.
//!
//! Actions run synchronously on the drain task and must not block: a slow
//! action stalls everything queued behind it.

use std::any::Any;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::StrandError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a FIFO execution serializer
///
/// Clones share the same queue. The drain task stops once every clone is
/// gone and the queue is empty.
#[derive(Clone)]
pub struct Strand {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand").field("name", &self.name).finish()
    }
}

impl Strand {
    /// Create a strand and spawn its drain task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(name: impl Into<String>) -> Self {
        let name: Arc<str> = Arc::from(name.into());
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(drain(name.clone(), receiver));
        Self { name, sender }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `action` behind everything already submitted to this strand.
    ///
    /// The returned task resolves with the action's result, or with
    /// [`StrandError::Panicked`] if it panicked. Dropping the task does not
    /// cancel the action.
    pub fn schedule_exclusive<F, T>(&self, action: F) -> StrandTask<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let name = self.name.clone();
        let job: Job = Box::new(move || {
            let outcome = catch_unwind(AssertUnwindSafe(action)).map_err(|payload| {
                let message = panic_message(payload.as_ref());
                error!(strand = %name, "strand action panicked: {}", message);
                StrandError::Panicked(message)
            });
            let _ = tx.send(outcome);
        });

        if self.sender.send(job).is_err() {
            debug!(strand = %self.name, "strand drain task is gone, dropping action");
        }
        StrandTask { receiver: rx }
    }
}

async fn drain(name: Arc<str>, mut receiver: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = receiver.recv().await {
        job();
    }
    debug!(strand = %name, "strand closed");
}

/// Completion handle for one scheduled action
pub struct StrandTask<T> {
    receiver: oneshot::Receiver<Result<T, StrandError>>,
}

impl<T> Future for StrandTask<T> {
    type Output = Result<T, StrandError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(StrandError::Closed)))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
