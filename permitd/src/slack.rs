//! Slack integration: interactive permission cards, informational
//! notifications, and button callbacks over Socket Mode.
//!
//! The Web API side (posting and editing messages) is plain HTTPS and works
//! independently of the Socket Mode connection, so the coordinator can call
//! post/update at any time and get a success or a terminal error for that
//! call. Reconnecting the Socket Mode websocket is this module's own
//! problem.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::SlackConfig;
use crate::protocol::{Notification, PermissionRequest};

const SLACK_API_BASE: &str = "https://slack.com/api";
const ACTION_APPROVE: &str = "approve_permission";
const ACTION_DENY: &str = "deny_permission";
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Identifies a posted chat message well enough to edit it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatHandle {
    pub channel: String,
    pub ts: String,
}

/// Terminal status a request card is edited to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Approved,
    Denied,
    /// The user returned to the machine before responding via chat.
    AnsweredLocally,
    /// The hook connection closed while the user was still idle; some other
    /// path resolved the prompt.
    AnsweredRemotely,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Approved => "approved",
            Outcome::Denied => "denied",
            Outcome::AnsweredLocally => "answered_locally",
            Outcome::AnsweredRemotely => "answered_remotely",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonChoice {
    Approve,
    Deny,
}

/// A button press relayed from Slack, keyed by the daemon-assigned
/// request id carried in the button payload.
#[derive(Debug, Clone)]
pub struct ButtonEvent {
    pub request_id: String,
    pub choice: ButtonChoice,
}

/// What the coordinator needs from a chat service. `SlackHandler` is the
/// production implementation; tests substitute a recording fake.
#[async_trait]
pub trait ChatPort: Send + Sync {
    async fn post_request(&self, request: &PermissionRequest) -> Result<ChatHandle>;
    async fn post_notification(&self, notification: &Notification) -> Result<()>;
    async fn update_resolved(
        &self,
        handle: &ChatHandle,
        request: &PermissionRequest,
        outcome: Outcome,
    ) -> Result<()>;
}

pub struct SlackHandler {
    http: reqwest::Client,
    config: SlackConfig,
    actions_tx: mpsc::Sender<ButtonEvent>,
}

impl SlackHandler {
    pub fn new(config: SlackConfig, actions_tx: mpsc::Sender<ButtonEvent>) -> Arc<Self> {
        Arc::new(Self {
            http: reqwest::Client::new(),
            config,
            actions_tx,
        })
    }

    async fn call_api(&self, method: &str, payload: Value) -> Result<Value> {
        let response: Value = self
            .http
            .post(format!("{SLACK_API_BASE}/{method}"))
            .bearer_auth(&self.config.bot_token)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("slack {method} request failed"))?
            .json()
            .await
            .with_context(|| format!("slack {method} returned a non-JSON body"))?;

        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(anyhow!("slack {method} failed: {error}"));
        }
        Ok(response)
    }

    /// Ask Slack for a fresh Socket Mode websocket URL.
    async fn open_socket_url(&self) -> Result<String> {
        let response: Value = self
            .http
            .post(format!("{SLACK_API_BASE}/apps.connections.open"))
            .bearer_auth(&self.config.app_token)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .send()
            .await
            .context("apps.connections.open request failed")?
            .json()
            .await
            .context("apps.connections.open returned a non-JSON body")?;

        if response.get("ok").and_then(Value::as_bool) != Some(true) {
            let error = response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            return Err(anyhow!("apps.connections.open failed: {error}"));
        }
        response
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("apps.connections.open response had no url"))
    }

    /// Run the Socket Mode connection until the daemon stops. Each dropped
    /// connection is retried with capped exponential backoff.
    pub async fn run_socket_mode(self: Arc<Self>) {
        let mut delay = RECONNECT_INITIAL;
        loop {
            match self.connect_and_pump().await {
                Ok(()) => {
                    // Slack asked us to reconnect; do so promptly.
                    delay = RECONNECT_INITIAL;
                }
                Err(err) => {
                    warn!(
                        retry_in_secs = delay.as_secs(),
                        "Slack Socket Mode connection lost: {:#}", err
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(RECONNECT_MAX);
                }
            }
        }
    }

    async fn connect_and_pump(&self) -> Result<()> {
        let url = self.open_socket_url().await?;
        let (mut stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("websocket connect failed")?;
        info!("Slack Socket Mode connected");

        while let Some(message) = stream.next().await {
            match message.context("websocket read failed")? {
                Message::Text(text) => {
                    let envelope: Value = match serde_json::from_str(&text) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!("Unparseable Socket Mode envelope: {}", err);
                            continue;
                        }
                    };

                    // Envelopes must be acked promptly or Slack re-delivers.
                    if let Some(envelope_id) =
                        envelope.get("envelope_id").and_then(Value::as_str)
                    {
                        let ack = json!({ "envelope_id": envelope_id }).to_string();
                        stream
                            .send(Message::Text(ack.into()))
                            .await
                            .context("websocket ack failed")?;
                    }

                    match envelope.get("type").and_then(Value::as_str) {
                        Some("hello") => debug!("Socket Mode hello received"),
                        Some("disconnect") => {
                            let reason = envelope
                                .get("reason")
                                .and_then(Value::as_str)
                                .unwrap_or("unspecified");
                            info!(reason = %reason, "Slack requested reconnect");
                            return Ok(());
                        }
                        Some("interactive") => self.handle_interactive(&envelope).await,
                        other => debug!(envelope_type = ?other, "Ignoring Socket Mode envelope"),
                    }
                }
                Message::Ping(payload) => {
                    stream
                        .send(Message::Pong(payload))
                        .await
                        .context("websocket pong failed")?;
                }
                Message::Close(frame) => {
                    debug!(frame = ?frame, "Websocket closed by Slack");
                    return Err(anyhow!("websocket closed"));
                }
                _ => {}
            }
        }
        Err(anyhow!("websocket stream ended"))
    }

    async fn handle_interactive(&self, envelope: &Value) {
        let payload = &envelope["payload"];
        if payload.get("type").and_then(Value::as_str) != Some("block_actions") {
            return;
        }
        let Some(action) = payload
            .get("actions")
            .and_then(Value::as_array)
            .and_then(|actions| actions.first())
        else {
            return;
        };
        let choice = match action.get("action_id").and_then(Value::as_str) {
            Some(ACTION_APPROVE) => ButtonChoice::Approve,
            Some(ACTION_DENY) => ButtonChoice::Deny,
            other => {
                debug!(action_id = ?other, "Ignoring unknown block action");
                return;
            }
        };
        let Some(request_id) = action.get("value").and_then(Value::as_str) else {
            warn!("Block action carried no request id");
            return;
        };

        info!(request_id = %request_id, choice = ?choice, "Button press received");
        if self
            .actions_tx
            .send(ButtonEvent {
                request_id: request_id.to_string(),
                choice,
            })
            .await
            .is_err()
        {
            warn!("Coordinator is gone; dropping button press");
        }
    }
}

#[async_trait]
impl ChatPort for SlackHandler {
    async fn post_request(&self, request: &PermissionRequest) -> Result<ChatHandle> {
        let response = self
            .call_api(
                "chat.postMessage",
                json!({
                    "channel": self.config.channel,
                    "text": format!("Permission request: {}", request.tool_name),
                    "blocks": request_blocks(request),
                }),
            )
            .await?;

        let ts = response
            .get("ts")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("chat.postMessage response had no ts"))?;
        let channel = response
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or(&self.config.channel);

        info!(
            request_id = %request.request_id,
            channel = %channel,
            ts = %ts,
            "Posted permission request to Slack"
        );
        Ok(ChatHandle {
            channel: channel.to_string(),
            ts: ts.to_string(),
        })
    }

    async fn post_notification(&self, notification: &Notification) -> Result<()> {
        self.call_api(
            "chat.postMessage",
            json!({
                "channel": self.config.channel,
                "text": format!("Notification: {}", notification.notification_type),
                "blocks": notification_blocks(notification),
            }),
        )
        .await?;
        info!(
            notification_id = %notification.notification_id,
            notification_type = %notification.notification_type,
            "Posted notification to Slack"
        );
        Ok(())
    }

    async fn update_resolved(
        &self,
        handle: &ChatHandle,
        request: &PermissionRequest,
        outcome: Outcome,
    ) -> Result<()> {
        self.call_api(
            "chat.update",
            json!({
                "channel": handle.channel,
                "ts": handle.ts,
                "text": format!("{}: {}", outcome_title(outcome), request.tool_name),
                "blocks": resolved_blocks(request, outcome),
            }),
        )
        .await?;
        debug!(
            request_id = %request.request_id,
            outcome = outcome.as_str(),
            "Updated Slack card"
        );
        Ok(())
    }
}

/// Truncate on character boundaries, appending an ellipsis when shortened.
fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}...")
}

/// How the tool input is rendered on the interactive card. Commands show
/// verbatim, file operations show the path plus a content preview, and
/// anything else is pretty-printed JSON.
fn input_display(tool_input: &Value) -> String {
    if let Some(command) = tool_input.get("command").and_then(Value::as_str) {
        return command.to_string();
    }
    if let Some(file_path) = tool_input.get("file_path").and_then(Value::as_str) {
        let mut display = file_path.to_string();
        if let Some(content) = tool_input.get("content").and_then(Value::as_str) {
            display.push_str("\n\n");
            display.push_str(&truncate(content, 200));
        }
        return display;
    }
    let pretty = serde_json::to_string_pretty(tool_input).unwrap_or_else(|_| tool_input.to_string());
    truncate(&pretty, 500)
}

/// Compact input rendering for resolved cards.
fn short_input_display(tool_input: &Value) -> String {
    if let Some(command) = tool_input.get("command").and_then(Value::as_str) {
        return command.to_string();
    }
    if let Some(file_path) = tool_input.get("file_path").and_then(Value::as_str) {
        return file_path.to_string();
    }
    truncate(&tool_input.to_string(), 100)
}

fn request_blocks(request: &PermissionRequest) -> Value {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": "🔐 Permission Request",
                "emoji": true,
            },
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("*Tool:* {}", request.tool_name),
            },
        }),
        json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("```{}```", input_display(&request.tool_input)),
            },
        }),
    ];

    if let Some(description) = request.tool_input.get("description").and_then(Value::as_str) {
        blocks.push(json!({
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("*Description:* {}", description),
            },
        }));
    }

    blocks.push(json!({
        "type": "context",
        "elements": [{
            "type": "mrkdwn",
            "text": format!("Requested at {}", chrono::Local::now().format("%H:%M:%S")),
        }],
    }));

    blocks.push(json!({
        "type": "actions",
        "elements": [
            {
                "type": "button",
                "text": { "type": "plain_text", "text": "✓ Approve", "emoji": true },
                "style": "primary",
                "action_id": ACTION_APPROVE,
                "value": request.request_id,
            },
            {
                "type": "button",
                "text": { "type": "plain_text", "text": "✗ Deny", "emoji": true },
                "style": "danger",
                "action_id": ACTION_DENY,
                "value": request.request_id,
            },
        ],
    }));

    Value::Array(blocks)
}

fn outcome_title(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Approved => "✅ Approved",
        Outcome::Denied => "❌ Denied",
        Outcome::AnsweredLocally => "⌨️ Answered Locally",
        Outcome::AnsweredRemotely => "📡 Answered Remotely",
    }
}

fn outcome_context(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Approved => "Approved via Slack",
        Outcome::Denied => "Denied via Slack",
        Outcome::AnsweredLocally => "You returned to your computer",
        Outcome::AnsweredRemotely => "Resolved from another session",
    }
}

/// Replaces an interactive card with a static summary; no buttons survive.
fn resolved_blocks(request: &PermissionRequest, outcome: Outcome) -> Value {
    json!([
        {
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!("{}: {}", outcome_title(outcome), request.tool_name),
                "emoji": true,
            },
        },
        {
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!("```{}```", short_input_display(&request.tool_input)),
            },
        },
        {
            "type": "context",
            "elements": [{ "type": "mrkdwn", "text": outcome_context(outcome) }],
        },
    ])
}

fn notification_emoji(notification_type: &str) -> &'static str {
    match notification_type {
        "idle_prompt" => "⏳",
        "auth_success" => "🔑",
        "elicitation_dialog" => "💬",
        _ => "📢",
    }
}

fn notification_blocks(notification: &Notification) -> Value {
    let type_display = notification
        .notification_type
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");

    let mut blocks = vec![json!({
        "type": "header",
        "text": {
            "type": "plain_text",
            "text": format!(
                "{} {}",
                notification_emoji(&notification.notification_type),
                type_display
            ),
            "emoji": true,
        },
    })];

    if !notification.message.is_empty() {
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": truncate(&notification.message, 500) },
        }));
    }

    let mut context = format!("Received at {}", notification.received_at.format("%H:%M:%S"));
    if let Some(cwd) = &notification.cwd {
        let display = if cwd.chars().count() > 50 {
            let tail: String = cwd.chars().rev().take(47).collect::<Vec<_>>().into_iter().rev().collect();
            format!("...{tail}")
        } else {
            cwd.clone()
        };
        context.push_str(&format!(" • in `{display}`"));
    }
    blocks.push(json!({
        "type": "context",
        "elements": [{ "type": "mrkdwn", "text": context }],
    }));

    Value::Array(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tool_input: Value) -> PermissionRequest {
        PermissionRequest {
            request_id: "req-123".to_string(),
            tool_name: "Bash".to_string(),
            tool_input,
        }
    }

    #[test]
    fn buttons_carry_the_request_id() {
        let blocks = request_blocks(&request(json!({"command": "ls -la"})));
        let actions = blocks
            .as_array()
            .unwrap()
            .iter()
            .find(|block| block["type"] == "actions")
            .expect("actions block present");
        let elements = actions["elements"].as_array().unwrap();
        assert_eq!(elements.len(), 2);
        for element in elements {
            assert_eq!(element["value"], "req-123");
        }
        assert_eq!(elements[0]["action_id"], ACTION_APPROVE);
        assert_eq!(elements[1]["action_id"], ACTION_DENY);
    }

    #[test]
    fn resolved_blocks_have_no_buttons() {
        for outcome in [
            Outcome::Approved,
            Outcome::Denied,
            Outcome::AnsweredLocally,
            Outcome::AnsweredRemotely,
        ] {
            let blocks = resolved_blocks(&request(json!({"command": "ls"})), outcome);
            assert!(blocks
                .as_array()
                .unwrap()
                .iter()
                .all(|block| block["type"] != "actions"));
        }
    }

    #[test]
    fn command_input_shows_verbatim() {
        assert_eq!(input_display(&json!({"command": "cargo test"})), "cargo test");
    }

    #[test]
    fn file_input_previews_content() {
        let display = input_display(&json!({
            "file_path": "/tmp/a.txt",
            "content": "x".repeat(300),
        }));
        assert!(display.starts_with("/tmp/a.txt\n\n"));
        assert!(display.ends_with("..."));
        // 200 chars of content plus the ellipsis.
        assert_eq!(display.len(), "/tmp/a.txt\n\n".len() + 203);
    }

    #[test]
    fn generic_input_is_capped_json() {
        let display = input_display(&json!({"pattern": "y".repeat(600)}));
        assert!(display.ends_with("..."));
        assert!(display.chars().count() <= 503);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo wörld".repeat(20);
        let out = truncate(&text, 10);
        assert_eq!(out.chars().count(), 13);
    }

    #[test]
    fn notification_blocks_include_message_and_cwd() {
        let blocks = notification_blocks(&Notification {
            notification_id: "n-1".to_string(),
            notification_type: "idle_prompt".to_string(),
            message: "waiting for input".to_string(),
            cwd: Some("/home/user/project".to_string()),
            received_at: chrono::Local::now(),
        });
        let rendered = blocks.to_string();
        assert!(rendered.contains("⏳ Idle Prompt"));
        assert!(rendered.contains("waiting for input"));
        assert!(rendered.contains("/home/user/project"));
    }

    #[test]
    fn unknown_notification_type_gets_generic_emoji() {
        assert_eq!(notification_emoji("something_new"), "📢");
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(Outcome::AnsweredLocally.as_str(), "answered_locally");
        assert_eq!(Outcome::AnsweredRemotely.as_str(), "answered_remotely");
    }
}
