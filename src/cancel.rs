//! Cancellation for work handed to the blocking pool.
//!
//! Dropping the future that awaits a `spawn_blocking` task does not stop
//! the task. A [`CancelOnDrop`] held by the awaiting side raises a shared
//! flag when that side goes away, and the blocking code checks the flag
//! before each step that talks to a server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Read side of a cancellation flag, moved into the blocking closure.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Raises its flag when dropped, whether the awaited task finished or not.
#[derive(Debug, Default)]
pub struct CancelOnDrop(Arc<AtomicBool>);

impl CancelOnDrop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self) -> CancelFlag {
        CancelFlag(Arc::clone(&self.0))
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
