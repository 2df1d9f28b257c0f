//! Rest - a cancellable timed recovery task
//!
//! Every tick the rest task adds the entity's recovery rate to its energy.
//! Ordering within a tick is fixed: increment first, then the elapsed-time
//! check, then the completion signal. Nothing is applied after completion is
//! signalled, and nothing after cancellation.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestOutcome {
    Completed { increments: u32 },
    Cancelled { increments: u32 },
}

impl RestOutcome {
    pub fn increments(&self) -> u32 {
        match self {
            RestOutcome::Completed { increments } | RestOutcome::Cancelled { increments } => {
                *increments
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RestOutcome::Completed { .. })
    }
}

/// Cancels a running rest from anywhere.
#[derive(Debug, Clone)]
pub struct RestCanceller {
    notify: Arc<Notify>,
}

impl RestCanceller {
    /// Stop the rest timer. A permit is stored, so cancelling before the
    /// task first polls still takes effect.
    pub fn cancel(&self) {
        self.notify.notify_one();
    }
}

/// Caller's side of a running rest.
#[derive(Debug)]
pub struct RestHandle {
    canceller: RestCanceller,
    increments: Arc<AtomicU32>,
    done: oneshot::Receiver<RestOutcome>,
}

impl RestHandle {
    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> RestCanceller {
        self.canceller.clone()
    }

    /// Increments applied so far.
    pub fn increments(&self) -> u32 {
        self.increments.load(Ordering::SeqCst)
    }

    /// Resolves once the rest completes or is cancelled. If the task was torn
    /// down without reporting (owner disposed), the rest counts as cancelled.
    pub async fn wait(self) -> RestOutcome {
        let increments = Arc::clone(&self.increments);
        self.done.await.unwrap_or(RestOutcome::Cancelled {
            increments: increments.load(Ordering::SeqCst),
        })
    }
}

/// Task side of a running rest.
pub(crate) struct RestTask {
    pub(crate) cancel: Arc<Notify>,
    pub(crate) increments: Arc<AtomicU32>,
    pub(crate) done: oneshot::Sender<RestOutcome>,
}

impl RestTask {
    pub(crate) fn record_increment(&self) -> u32 {
        self.increments.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn count(&self) -> u32 {
        self.increments.load(Ordering::SeqCst)
    }

    pub(crate) fn finish(self, outcome: RestOutcome) {
        // The handle may have been dropped; nobody is waiting then.
        let _ = self.done.send(outcome);
    }
}

/// Create the two halves of a rest.
pub(crate) fn rest_channel() -> (RestHandle, RestTask) {
    let notify = Arc::new(Notify::new());
    let increments = Arc::new(AtomicU32::new(0));
    let (tx, rx) = oneshot::channel();
    (
        RestHandle {
            canceller: RestCanceller {
                notify: Arc::clone(&notify),
            },
            increments: Arc::clone(&increments),
            done: rx,
        },
        RestTask {
            cancel: notify,
            increments,
            done: tx,
        },
    )
}
