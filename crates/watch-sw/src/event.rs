//! Event lifetime extension.
//!
//! Work registered with [`ExtendableEvent::wait_until`] starts running at once
//! on its own task. The event is only finished once [`ExtendableEvent::settle`]
//! has joined all of it, so the host never tears the worker down halfway
//! through a cache write.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Work an event handler started and the dispatcher must join.
#[derive(Debug)]
pub struct ExtendableEvent {
    kind: &'static str,
    tasks: Vec<JoinHandle<()>>,
}

impl ExtendableEvent {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            tasks: Vec::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Keep the event alive until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push(tokio::spawn(work));
    }

    /// Number of extensions registered so far.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every extension has run to completion.
    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(|task| task.is_finished())
    }

    /// Join every extension. Returns how many were joined.
    pub async fn settle(self) -> usize {
        let count = self.tasks.len();
        for handle in self.tasks {
            if let Err(e) = handle.await {
                warn!(event = self.kind, error = %e, "Extended work did not complete");
            }
        }
        trace!(event = self.kind, count, "Event settled");
        count
    }
}
