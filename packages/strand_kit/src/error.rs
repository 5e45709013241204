/// Errors raised by [`crate::BinaryHeap`] operations that need a minimum
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeapError {
    /// Peek, pop or remove_min was called on an empty heap
    #[error("heap is empty")]
    Empty,
}

/// Errors delivered through a [`crate::StrandTask`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrandError {
    /// The action panicked; the strand kept running
    #[error("strand action panicked: {0}")]
    Panicked(String),
    /// The action never ran because the strand's drain task is gone
    #[error("strand is closed")]
    Closed,
}
