//! Script execution queue: the broker between tool handlers and the
//! page-side runner.
//!
//! The two sides never talk directly. A tool handler enqueues a code string
//! and awaits the result; the runner polls [`ScriptQueue::dequeue`] for
//! work and pushes the outcome back with [`ScriptQueue::resolve`] or
//! [`ScriptQueue::reject`]. A oneshot channel per pending execution carries
//! the eventual result to the awaiting handler.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue ──► pending table + per-target FIFO
//!                │
//!                │ dequeue (runner poll): FIFO position consumed,
//!                │                         table entry KEPT
//!                ▼
//!        resolve / reject / timeout / cancel_target: table entry removed
//! ```
//!
//! Keeping the table entry across `dequeue` is deliberate: a runner that
//! crashes between fetching the code and reporting the result leaves the
//! entry in place, and the producer's deadline converts that into a clean
//! timeout instead of a hang.
//!
//! # Poisoning
//!
//! After a timeout (or any completion) the entry is gone, so a late
//! `resolve`/`reject` for that id finds nothing and is a no-op. A completed
//! execution can never be resurrected.
//!
//! # Ordering
//!
//! FIFO per target; no ordering across targets. Each `dequeue` serves at
//! most one script.

use crate::{Error, Result};
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A script handed to the runner: the pending id plus the code to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedScript {
    pub id: String,
    pub code: String,
}

struct PendingExecution {
    target_id: String,
    code: String,
    created_at: Instant,
    resolver: oneshot::Sender<Result<String>>,
}

#[derive(Default)]
struct QueueState {
    /// Executions awaiting a result, keyed by id. Entries survive dequeue.
    pending: HashMap<String, PendingExecution>,
    /// Per-target FIFO of ids the runner has not picked up yet.
    queues: HashMap<String, VecDeque<String>>,
}

/// Per-target FIFO broker with a hard per-execution deadline.
pub struct ScriptQueue {
    state: Mutex<QueueState>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl Default for ScriptQueue {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SCRIPT_TIMEOUT)
    }
}

impl ScriptQueue {
    /// Create a queue with the given execution deadline (30 s in production;
    /// tests shorten it).
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            timeout,
            next_id: AtomicU64::new(0),
        }
    }

    /// Queue `code` for the target and await the runner's serialized result.
    ///
    /// Resolves with the runner's string (which may carry a trailing
    /// `"\n\nConsole logs:\n..."` block, surfaced verbatim), or fails with:
    ///
    /// - [`Error::Timeout`] when the deadline passes; the entry is removed
    ///   first, so a late runner response is dropped
    /// - [`Error::TargetClosed`] when [`ScriptQueue::cancel_target`] fires
    /// - whatever error string the runner reported, as [`Error::Tool`]
    pub async fn enqueue(&self, target_id: &str, code: impl Into<String>) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        let id = format!("exec-{}", self.next_id.fetch_add(1, Ordering::Relaxed));

        {
            let mut state = self.state.lock().expect("script queue lock poisoned");
            state.pending.insert(
                id.clone(),
                PendingExecution {
                    target_id: target_id.to_string(),
                    code: code.into(),
                    created_at: Instant::now(),
                    resolver: tx,
                },
            );
            state
                .queues
                .entry(target_id.to_string())
                .or_default()
                .push_back(id.clone());
        }
        debug!("queued script {id} for target {target_id}");

        // Whatever way this future ends (result, timeout, or being dropped
        // by a caller racing it against cancellation), the entry must leave
        // the table so late completions are no-ops and nothing leaks.
        let _cleanup = PendingCleanup { queue: self, id: &id };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a result: the queue itself went away.
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                warn!("script {id} timed out after {:?}", self.timeout);
                Err(Error::Timeout)
            }
        }
    }

    /// Runner poll: hand out the oldest not-yet-dequeued script for the
    /// target, if any. The pending-table entry stays until a result (or the
    /// deadline) arrives.
    pub fn dequeue(&self, target_id: &str) -> Option<QueuedScript> {
        let mut guard = self.state.lock().expect("script queue lock poisoned");
        let state = &mut *guard;
        let queue = state.queues.get_mut(target_id)?;
        // Skip ids whose execution already expired while still queued.
        while let Some(id) = queue.pop_front() {
            if let Some(pending) = state.pending.get(&id) {
                return Some(QueuedScript {
                    id,
                    code: pending.code.clone(),
                });
            }
        }
        None
    }

    /// Complete an execution with the runner's result string. Unknown (or
    /// already-completed / timed-out) ids are ignored.
    pub fn resolve(&self, id: &str, result: impl Into<String>) {
        if let Some(pending) = self.take(id) {
            debug!(
                "script {id} resolved after {:?}",
                pending.created_at.elapsed()
            );
            let _ = pending.resolver.send(Ok(result.into()));
        } else {
            debug!("ignoring late resolve for script {id}");
        }
    }

    /// Fail an execution with the runner's error string. Unknown ids are
    /// ignored.
    pub fn reject(&self, id: &str, err: impl Into<String>) {
        if let Some(pending) = self.take(id) {
            let err = err.into();
            warn!("script {id} rejected by runner: {err}");
            let _ = pending.resolver.send(Err(Error::tool(err)));
        } else {
            debug!("ignoring late reject for script {id}");
        }
    }

    /// The target went away: reject every pending execution for it, whether
    /// still queued or already dequeued.
    pub fn cancel_target(&self, target_id: &str) {
        let drained: Vec<(String, PendingExecution)> = {
            let mut state = self.state.lock().expect("script queue lock poisoned");
            state.queues.remove(target_id);
            let ids: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, p)| p.target_id == target_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
                .collect()
        };

        if !drained.is_empty() {
            warn!(
                "target {target_id} closed with {} pending script(s)",
                drained.len()
            );
        }
        for (_, pending) in drained {
            let _ = pending.resolver.send(Err(Error::target_closed(target_id)));
        }
    }

    /// Number of executions still awaiting a result for a target.
    pub fn pending_for_target(&self, target_id: &str) -> usize {
        let state = self.state.lock().expect("script queue lock poisoned");
        state
            .pending
            .values()
            .filter(|p| p.target_id == target_id)
            .count()
    }

    /// Remove a pending entry, returning it for completion.
    fn take(&self, id: &str) -> Option<PendingExecution> {
        let mut state = self.state.lock().expect("script queue lock poisoned");
        let pending = state.pending.remove(id)?;
        // If the runner never dequeued it, purge the FIFO slot too.
        if let Some(queue) = state.queues.get_mut(&pending.target_id) {
            queue.retain(|queued| queued.as_str() != id);
        }
        Some(pending)
    }
}

/// Removes the pending entry when the producer side of an execution ends
/// for any reason. A no-op when resolve/reject already took the entry.
struct PendingCleanup<'a> {
    queue: &'a ScriptQueue,
    id: &'a str,
}

impl Drop for PendingCleanup<'_> {
    fn drop(&mut self) {
        let _ = self.queue.take(self.id);
    }
}
