//! Strand Kit - serialized execution and deadline scheduling primitives
//!
//! This crate provides the building blocks the tab host runs on:
//! a [`Strand`] that executes closures one at a time in submission order,
//! a mutable-key [`BinaryHeap`] whose nodes can be adjusted or removed in
//! place, and a [`TimerThread`] that fires reschedulable callbacks off a
//! single sleeping driver task.
//! It has no HTTP dependencies.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use strand_kit::{Deadline, Strand, TimerThread};
//!
//! #[tokio::main]
//! async fn main() {
//!     let strand = Strand::new("counter");
//!     let total = strand.schedule_exclusive(|| 2 + 2).await.unwrap();
//!     assert_eq!(total, 4);
//!
//!     let timer = TimerThread::new();
//!     let callback = timer.register_callback(|| println!("tick"));
//!     callback
//!         .reschedule(Deadline::after(Duration::from_millis(50)))
//!         .await
//!         .unwrap();
//! }
//! ```

mod error;
pub mod heap;
pub mod strand;
pub mod timer;

pub use error::{HeapError, StrandError};
pub use heap::{BinaryHeap, NodeHandle};
pub use strand::{Strand, StrandTask};
pub use timer::{Deadline, TimerCallback, TimerThread};
