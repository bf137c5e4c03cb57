//! Wire types for the hook endpoint.
//!
//! Each hook connection carries exactly one newline-terminated JSON frame.
//! Frames with a notification marker are one-way; everything else must be a
//! permission request and receives exactly one response line.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Upper bound on a single request frame. Tool inputs can embed file
/// contents, so this is generous; anything larger is dropped unread.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Hook event name that marks a frame as a notification.
pub const NOTIFICATION_EVENT: &str = "Notification";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("permission request is missing tool_name")]
    MissingToolName,
    #[error("frame exceeds {MAX_FRAME_BYTES} bytes")]
    Oversized,
    #[error("connection closed before a full frame arrived")]
    Truncated,
}

/// Raw fields a hook may send. Unknown fields are ignored so the hook and
/// the daemon can evolve independently.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookFrame {
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl HookFrame {
    /// A frame is a notification when it names the notification hook event
    /// or carries a notification type; tool fields alone mean a permission
    /// request.
    pub fn is_notification(&self) -> bool {
        self.hook_event_name.as_deref() == Some(NOTIFICATION_EVENT)
            || self.notification_type.is_some()
    }
}

/// A classified inbound frame.
#[derive(Debug)]
pub enum Frame {
    Permission(PermissionRequest),
    Notification(Notification),
}

/// Parse and classify one frame. The daemon assigns the request id; ids in
/// the frame are never trusted.
pub fn parse_frame(raw: &str) -> Result<Frame, FrameError> {
    let frame: HookFrame = serde_json::from_str(raw)?;
    if frame.is_notification() {
        return Ok(Frame::Notification(Notification::from_frame(frame)));
    }
    PermissionRequest::from_frame(frame).map(Frame::Permission)
}

/// A permission request as tracked by the daemon. `tool_name` and
/// `tool_input` come verbatim from the hook and are used only for display.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub request_id: String,
    pub tool_name: String,
    pub tool_input: Value,
}

impl PermissionRequest {
    fn from_frame(frame: HookFrame) -> Result<Self, FrameError> {
        let tool_name = frame
            .tool_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or(FrameError::MissingToolName)?;
        Ok(Self {
            request_id: Uuid::new_v4().to_string(),
            tool_name,
            tool_input: frame.tool_input.unwrap_or_else(|| Value::Object(Default::default())),
        })
    }
}

/// A one-way notification. Never enters the pending table.
#[derive(Debug, Clone)]
pub struct Notification {
    pub notification_id: String,
    pub notification_type: String,
    pub message: String,
    pub cwd: Option<String>,
    pub received_at: chrono::DateTime<chrono::Local>,
}

impl Notification {
    fn from_frame(frame: HookFrame) -> Self {
        Self {
            notification_id: Uuid::new_v4().to_string(),
            notification_type: frame
                .notification_type
                .unwrap_or_else(|| "unknown".to_string()),
            message: frame.message.unwrap_or_default(),
            cwd: frame.cwd,
            received_at: chrono::Local::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Approve,
    Deny,
    Passthrough,
}

/// The single response line written back to a hook for a permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub action: Action,
    pub reason: String,
}

impl PermissionResponse {
    pub fn new(action: Action, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
        }
    }

    pub fn passthrough(reason: impl Into<String>) -> Self {
        Self::new(Action::Passthrough, reason)
    }
}
