//! The per-request state machine and the wiring between the four event
//! sources: new hook connections, idle transitions, chat button presses,
//! and hook disconnects.
//!
//! Resolution is at-most-once by construction: every terminal event funnels
//! through an atomic removal from the pending table, and only the winner
//! proceeds to update chat and answer the hook. Losing events find the
//! table entry gone and are dropped at debug level.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::ipc::HookConn;
use crate::protocol::{Action, Notification, PermissionRequest, PermissionResponse};
use crate::slack::{ButtonChoice, ButtonEvent, ChatPort, Outcome};
use crate::state::{HookWriter, PendingRequest, StateStore};

pub const REASON_ACTIVE: &str = "user active locally";
pub const REASON_RETURNED: &str = "user returned";
pub const REASON_POST_FAILED: &str = "chat post failed";
pub const REASON_TIMEOUT: &str = "request timed out";
pub const REASON_SHUTDOWN: &str = "daemon shutting down";
pub const REASON_APPROVED: &str = "Approved via chat";
pub const REASON_DENIED: &str = "Denied via chat";

/// Which event reached the resolution path. A resolver never aborts its own
/// task, so the trigger decides which of the entry's handles get cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Button,
    UserReturned,
    PeerClosed,
    Timeout,
    Shutdown,
}

/// Cheaply cloneable handle; every event-source task holds one.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    state: Arc<StateStore>,
    chat: Arc<dyn ChatPort>,
    request_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        state: Arc<StateStore>,
        chat: Arc<dyn ChatPort>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                chat,
                request_timeout,
            }),
        }
    }

    /// Entry point for a permission request the IPC server handed off. Owns
    /// the connection from here on.
    pub async fn handle_permission_request(&self, request: PermissionRequest, conn: HookConn) {
        let HookConn { reader, mut writer } = conn;
        let idle = self.inner.state.snapshot_idle().await;

        if !idle.is_idle {
            info!(
                request_id = %request.request_id,
                tool = %request.tool_name,
                "User active locally; passing through"
            );
            write_response(&mut writer, &PermissionResponse::passthrough(REASON_ACTIVE)).await;
            return;
        }

        info!(
            request_id = %request.request_id,
            tool = %request.tool_name,
            idle_secs = idle.duration.as_secs(),
            "User idle; posting permission request to chat"
        );

        let chat_handle = match self.inner.chat.post_request(&request).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    request_id = %request.request_id,
                    "Chat post failed; passing through: {:#}", err
                );
                write_response(&mut writer, &PermissionResponse::passthrough(REASON_POST_FAILED))
                    .await;
                return;
            }
        };

        let request_id = request.request_id.clone();
        self.inner
            .state
            .insert(PendingRequest {
                request,
                created_at: Instant::now(),
                hook_writer: writer,
                chat_handle,
                watcher: None,
                timeout: None,
            })
            .await;

        let watcher = tokio::spawn({
            let this = self.clone();
            let request_id = request_id.clone();
            async move {
                watch_peer(reader).await;
                this.resolve(&request_id, Trigger::PeerClosed, Outcome::AnsweredRemotely, None)
                    .await;
            }
        });
        let timeout = tokio::spawn({
            let this = self.clone();
            let request_id = request_id.clone();
            async move {
                tokio::time::sleep(this.inner.request_timeout).await;
                this.resolve(
                    &request_id,
                    Trigger::Timeout,
                    Outcome::AnsweredLocally,
                    Some(PermissionResponse::passthrough(REASON_TIMEOUT)),
                )
                .await;
            }
        });

        if !self
            .inner
            .state
            .arm(&request_id, watcher.abort_handle(), timeout.abort_handle())
            .await
        {
            // Resolved before arming finished; the helper tasks are orphans.
            watcher.abort();
            timeout.abort();
            return;
        }

        // The idle flag may have flipped while the chat post was in flight,
        // in which case the drain ran before this entry existed. Converge
        // here rather than waiting out the timeout.
        if !self.inner.state.snapshot_idle().await.is_idle {
            self.resolve(
                &request_id,
                Trigger::UserReturned,
                Outcome::AnsweredLocally,
                Some(PermissionResponse::passthrough(REASON_RETURNED)),
            )
            .await;
        }
    }

    /// One-way notifications never enter the pending table; idle decides
    /// whether they reach chat at all.
    pub async fn handle_notification(&self, notification: Notification) {
        let idle = self.inner.state.snapshot_idle().await;
        if !idle.is_idle {
            info!(
                notification_id = %notification.notification_id,
                notification_type = %notification.notification_type,
                active_secs = idle.duration.as_secs(),
                "User active; not posting notification"
            );
            return;
        }

        match self.inner.chat.post_notification(&notification).await {
            Ok(()) => info!(
                notification_id = %notification.notification_id,
                notification_type = %notification.notification_type,
                idle_secs = idle.duration.as_secs(),
                "Notification posted"
            ),
            Err(err) => warn!(
                notification_id = %notification.notification_id,
                "Failed to post notification: {:#}", err
            ),
        }
    }

    /// Idle monitor transition. Going active retires every pending request:
    /// the local prompt is about to be answerable again.
    pub async fn on_idle_change(&self, is_idle: bool) {
        let Some(transition) = self.inner.state.set_idle(is_idle).await else {
            return;
        };
        info!(
            is_idle,
            previous_state_secs = transition.previous_duration.as_secs(),
            "Idle state changed"
        );
        if is_idle {
            return;
        }

        let drained = self.inner.state.drain().await;
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "User returned; resolving pending requests");
        for entry in drained {
            self.finish(
                entry,
                Trigger::UserReturned,
                Outcome::AnsweredLocally,
                Some(PermissionResponse::passthrough(REASON_RETURNED)),
            )
            .await;
        }
    }

    /// Button press relayed from chat.
    pub async fn on_button(&self, event: ButtonEvent) {
        let (outcome, response) = match event.choice {
            ButtonChoice::Approve => (
                Outcome::Approved,
                PermissionResponse::new(Action::Approve, REASON_APPROVED),
            ),
            ButtonChoice::Deny => (
                Outcome::Denied,
                PermissionResponse::new(Action::Deny, REASON_DENIED),
            ),
        };
        self.resolve(&event.request_id, Trigger::Button, outcome, Some(response))
            .await;
    }

    /// Retire all pending requests before exit: best-effort chat update,
    /// guaranteed passthrough response.
    pub async fn shutdown(&self) {
        let drained = self.inner.state.drain().await;
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Resolving pending requests before shutdown");
        for entry in drained {
            self.finish(
                entry,
                Trigger::Shutdown,
                Outcome::AnsweredLocally,
                Some(PermissionResponse::passthrough(REASON_SHUTDOWN)),
            )
            .await;
        }
    }

    async fn resolve(
        &self,
        request_id: &str,
        trigger: Trigger,
        outcome: Outcome,
        response: Option<PermissionResponse>,
    ) {
        let Some(entry) = self.inner.state.remove(request_id).await else {
            debug!(request_id = %request_id, trigger = ?trigger, "Event lost the resolution race");
            return;
        };
        self.finish(entry, trigger, outcome, response).await;
    }

    async fn finish(
        &self,
        mut entry: PendingRequest,
        trigger: Trigger,
        outcome: Outcome,
        response: Option<PermissionResponse>,
    ) {
        info!(
            request_id = %entry.request.request_id,
            tool = %entry.request.tool_name,
            trigger = ?trigger,
            outcome = outcome.as_str(),
            "Resolving request"
        );

        // A stale card is acceptable; the hook answer still goes out.
        if let Err(err) = self
            .inner
            .chat
            .update_resolved(&entry.chat_handle, &entry.request, outcome)
            .await
        {
            warn!(
                request_id = %entry.request.request_id,
                "Failed to update chat card: {:#}", err
            );
        }

        if let Some(response) = response {
            write_response(&mut entry.hook_writer, &response).await;
        }

        // Cancel whichever helper tasks did not trigger this resolution;
        // a task never aborts itself.
        if trigger != Trigger::Timeout {
            if let Some(timeout) = entry.timeout.take() {
                timeout.abort();
            }
        }
        if trigger != Trigger::PeerClosed {
            if let Some(watcher) = entry.watcher.take() {
                watcher.abort();
            }
        }
    }
}

/// Block until the hook's side of the connection closes. The hook sends one
/// frame and then waits, so anything beyond EOF detection is unexpected.
async fn watch_peer(mut reader: Box<dyn AsyncRead + Send + Unpin>) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => debug!(bytes = n, "Unexpected bytes from hook after its frame"),
        }
    }
}

/// Write the single response line and close the write half. A peer that
/// already gave up is logged, not propagated.
async fn write_response(writer: &mut HookWriter, response: &PermissionResponse) {
    let mut line = match serde_json::to_string(response) {
        Ok(line) => line,
        Err(err) => {
            warn!("Failed to encode hook response: {}", err);
            return;
        }
    };
    line.push('\n');
    if let Err(err) = writer.write_all(line.as_bytes()).await {
        warn!("Failed to write hook response: {}", err);
        return;
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}
