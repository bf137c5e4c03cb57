//! Shared daemon state: the idle record and the pending-request table.
//!
//! Both live behind one async mutex. Nothing here performs I/O while the
//! lock is held; callers do chat updates and hook writes after the
//! relevant entry has been removed, which is what makes resolution
//! at-most-once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::io::AsyncWrite;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::protocol::PermissionRequest;
use crate::slack::ChatHandle;

/// Write half of a hook connection, transport-erased so the coordinator is
/// independent of Unix sockets vs named pipes (and tests can use an
/// in-memory duplex).
pub type HookWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy)]
pub struct IdleSnapshot {
    pub is_idle: bool,
    pub since: Instant,
    pub duration: Duration,
}

/// Returned by `set_idle` for a real transition; `None` means no-op.
#[derive(Debug, Clone, Copy)]
pub struct IdleTransition {
    pub is_idle: bool,
    /// How long the previous state had held.
    pub previous_duration: Duration,
}

/// A permission request that has been posted to chat and is awaiting a
/// terminal event. Only constructed after the chat post succeeded, so
/// `chat_handle` is always present.
pub struct PendingRequest {
    pub request: PermissionRequest,
    pub created_at: Instant,
    pub hook_writer: HookWriter,
    pub chat_handle: ChatHandle,
    pub watcher: Option<AbortHandle>,
    pub timeout: Option<AbortHandle>,
}

struct Inner {
    is_idle: bool,
    idle_since: Instant,
    pending: HashMap<String, PendingRequest>,
}

pub struct StateStore {
    inner: Mutex<Inner>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// The daemon starts out treating the user as active; the idle monitor
    /// corrects this within its warm-up window.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                is_idle: false,
                idle_since: Instant::now(),
                pending: HashMap::new(),
            }),
        }
    }

    pub async fn snapshot_idle(&self) -> IdleSnapshot {
        let inner = self.inner.lock().await;
        IdleSnapshot {
            is_idle: inner.is_idle,
            since: inner.idle_since,
            duration: inner.idle_since.elapsed(),
        }
    }

    /// Record an idle transition. A no-op when the state is unchanged, so
    /// callers can fire change handling exactly once per real transition,
    /// outside the lock.
    pub async fn set_idle(&self, is_idle: bool) -> Option<IdleTransition> {
        let mut inner = self.inner.lock().await;
        if inner.is_idle == is_idle {
            return None;
        }
        let previous_duration = inner.idle_since.elapsed();
        inner.is_idle = is_idle;
        inner.idle_since = Instant::now();
        Some(IdleTransition {
            is_idle,
            previous_duration,
        })
    }

    pub async fn insert(&self, entry: PendingRequest) {
        let mut inner = self.inner.lock().await;
        let request_id = entry.request.request_id.clone();
        debug!(request_id = %request_id, "Tracking pending request");
        let replaced = inner.pending.insert(request_id, entry);
        debug_assert!(replaced.is_none(), "request ids are unique per table lifetime");
    }

    /// Attach watcher/timeout abort handles to an already-inserted entry.
    /// Returns false when the entry was resolved in the meantime; the caller
    /// must then abort the tasks itself.
    pub async fn arm(
        &self,
        request_id: &str,
        watcher: AbortHandle,
        timeout: AbortHandle,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.pending.get_mut(request_id) {
            Some(entry) => {
                entry.watcher = Some(watcher);
                entry.timeout = Some(timeout);
                true
            }
            None => false,
        }
    }

    /// Atomically take an entry out of the table. Exactly one caller wins;
    /// everyone else gets `None` and must treat the event as a losing race.
    pub async fn remove(&self, request_id: &str) -> Option<PendingRequest> {
        let mut inner = self.inner.lock().await;
        let entry = inner.pending.remove(request_id);
        if entry.is_some() {
            debug!(request_id = %request_id, "Removed pending request");
        }
        entry
    }

    /// Snapshot of a pending request's display fields.
    pub async fn get(&self, request_id: &str) -> Option<PermissionRequest> {
        let inner = self.inner.lock().await;
        inner.pending.get(request_id).map(|entry| entry.request.clone())
    }

    /// Take every entry out of the table at once, for the idle→active drain
    /// and for shutdown.
    pub async fn drain(&self) -> Vec<PendingRequest> {
        let mut inner = self.inner.lock().await;
        let drained: Vec<PendingRequest> = inner.pending.drain().map(|(_, entry)| entry).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Drained pending requests");
        }
        drained
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(request_id: &str) -> PendingRequest {
        let (_, writer) = tokio::io::duplex(64);
        PendingRequest {
            request: PermissionRequest {
                request_id: request_id.to_string(),
                tool_name: "Bash".to_string(),
                tool_input: json!({"command": "ls"}),
            },
            created_at: Instant::now(),
            hook_writer: Box::new(writer),
            chat_handle: ChatHandle {
                channel: "C1".to_string(),
                ts: "1700000000.000100".to_string(),
            },
            watcher: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn set_idle_is_noop_when_unchanged() {
        let state = StateStore::new();
        assert!(state.set_idle(false).await.is_none());
        let transition = state.set_idle(true).await.expect("transition to idle");
        assert!(transition.is_idle);
        assert!(state.set_idle(true).await.is_none());
        let transition = state.set_idle(false).await.expect("transition to active");
        assert!(!transition.is_idle);
    }

    #[tokio::test]
    async fn duration_resets_across_transitions() {
        let state = StateStore::new();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let before = state.snapshot_idle().await;
        assert!(before.duration >= Duration::from_millis(20));

        state.set_idle(true).await.expect("transition");
        let after = state.snapshot_idle().await;
        assert!(after.is_idle);
        assert!(after.duration < before.duration);
    }

    #[tokio::test]
    async fn remove_is_first_winner_take_all() {
        let state = StateStore::new();
        state.insert(entry("req-1")).await;
        assert_eq!(state.pending_count().await, 1);

        assert!(state.remove("req-1").await.is_some());
        assert!(state.remove("req-1").await.is_none());
        assert_eq!(state.pending_count().await, 0);
    }

    #[tokio::test]
    async fn drain_empties_the_table() {
        let state = StateStore::new();
        state.insert(entry("req-1")).await;
        state.insert(entry("req-2")).await;

        let drained = state.drain().await;
        assert_eq!(drained.len(), 2);
        assert_eq!(state.pending_count().await, 0);
        assert!(state.remove("req-1").await.is_none());
    }

    #[tokio::test]
    async fn arm_fails_after_removal() {
        let state = StateStore::new();
        state.insert(entry("req-1")).await;

        let task = tokio::spawn(async {});
        let watcher = task.abort_handle();
        let timeout = task.abort_handle();
        assert!(state.arm("req-1", watcher, timeout).await);

        state.remove("req-1").await.expect("entry present");
        let task = tokio::spawn(async {});
        assert!(!state.arm("req-1", task.abort_handle(), task.abort_handle()).await);
    }

    #[tokio::test]
    async fn get_returns_display_fields_without_removing() {
        let state = StateStore::new();
        state.insert(entry("req-1")).await;
        let request = state.get("req-1").await.expect("entry present");
        assert_eq!(request.tool_name, "Bash");
        assert_eq!(state.pending_count().await, 1);
        assert!(state.get("req-2").await.is_none());
    }
}
