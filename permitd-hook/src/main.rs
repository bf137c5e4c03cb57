//! Hook client invoked by the coding assistant at its permission and
//! notification lifecycle points.
//!
//! Reads the hook payload from stdin, forwards it to the daemon over the
//! local endpoint, and for permission requests prints the assistant's
//! decision JSON on stdout. Every failure path exits 0 with no stdout so
//! the assistant's native local prompt takes over; this binary must never
//! be the reason a prompt is lost.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[cfg(unix)]
fn default_endpoint() -> PathBuf {
    // Keep in lockstep with the daemon's default; the hook intentionally
    // carries no dependency on the daemon crate.
    dirs::runtime_dir()
        .map(|dir| dir.join("permitd.sock"))
        .unwrap_or_else(|| PathBuf::from("/tmp/permitd.sock"))
}

#[cfg(windows)]
fn default_endpoint() -> PathBuf {
    PathBuf::from(r"\\.\pipe\permitd")
}

fn endpoint() -> PathBuf {
    std::env::var("PERMITD_SOCKET_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_endpoint)
}

fn request_timeout() -> Duration {
    let secs = std::env::var("PERMITD_REQUEST_TIMEOUT")
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

fn is_notification(payload: &Value) -> bool {
    payload.get("hook_event_name").and_then(Value::as_str) == Some("Notification")
        || payload.get("notification_type").is_some()
}

/// Map the daemon's decision to the assistant's documented hook output.
/// Passthrough (and anything unrecognized) prints nothing.
fn decision_output(response: &Value) -> Option<String> {
    let behavior = match response.get("action").and_then(Value::as_str) {
        Some("approve") => "allow",
        Some("deny") => "deny",
        Some("passthrough") => return None,
        other => {
            eprintln!("permitd-hook: unknown action from daemon: {other:?}");
            return None;
        }
    };
    Some(
        json!({
            "hookSpecificOutput": {
                "hookEventName": "PermissionRequest",
                "decision": { "behavior": behavior },
            }
        })
        .to_string(),
    )
}

#[cfg(unix)]
async fn connect(path: &PathBuf) -> std::io::Result<tokio::net::UnixStream> {
    tokio::net::UnixStream::connect(path).await
}

#[cfg(windows)]
async fn connect(
    path: &PathBuf,
) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeClient> {
    tokio::net::windows::named_pipe::ClientOptions::new().open(path.to_string_lossy().as_ref())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // The exit code is 0 on every path: a hook failure must read to the
    // assistant as "no decision", never as an error it surfaces to the user.
    run().await;
}

async fn run() {
    let mut raw = String::new();
    if tokio::io::stdin().read_to_string(&mut raw).await.is_err() || raw.trim().is_empty() {
        return;
    }
    let payload: Value = match serde_json::from_str(raw.trim()) {
        Ok(payload) => payload,
        Err(err) => {
            eprintln!("permitd-hook: invalid JSON on stdin: {err}");
            return;
        }
    };

    let notification = is_notification(&payload);
    if !notification && payload.get("tool_name").and_then(Value::as_str).is_none() {
        eprintln!("permitd-hook: request missing tool_name");
        return;
    }

    let path = endpoint();
    let mut stream = match connect(&path).await {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("permitd-hook: daemon not available at {}: {err}", path.display());
            return;
        }
    };

    let mut frame = payload.to_string();
    frame.push('\n');
    if let Err(err) = stream.write_all(frame.as_bytes()).await {
        eprintln!("permitd-hook: failed to send frame: {err}");
        return;
    }

    if notification {
        // One-way: the daemon closes without replying.
        return;
    }

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = tokio::time::timeout(request_timeout(), reader.read_line(&mut line)).await;
    match read {
        Ok(Ok(n)) if n > 0 => {}
        Ok(Ok(_)) => {
            // Daemon closed without a response: another path answered the
            // prompt; stay silent.
            return;
        }
        Ok(Err(err)) => {
            eprintln!("permitd-hook: failed to read response: {err}");
            return;
        }
        Err(_) => {
            eprintln!("permitd-hook: timed out waiting for daemon response");
            return;
        }
    }

    let response: Value = match serde_json::from_str(line.trim()) {
        Ok(response) => response,
        Err(err) => {
            eprintln!("permitd-hook: invalid response from daemon: {err}");
            return;
        }
    };
    if let Some(error) = response.get("error") {
        eprintln!("permitd-hook: daemon error: {error}");
        return;
    }

    if let Some(output) = decision_output(&response) {
        println!("{output}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn approve_maps_to_allow_behavior() {
        let output = decision_output(&json!({"action": "approve", "reason": "x"}))
            .expect("approve produces output");
        let parsed: Value = serde_json::from_str(&output).expect("valid JSON");
        assert_eq!(
            parsed["hookSpecificOutput"]["decision"]["behavior"],
            "allow"
        );
        assert_eq!(
            parsed["hookSpecificOutput"]["hookEventName"],
            "PermissionRequest"
        );
    }

    #[test]
    fn deny_maps_to_deny_behavior() {
        let output =
            decision_output(&json!({"action": "deny", "reason": "x"})).expect("deny output");
        let parsed: Value = serde_json::from_str(&output).expect("valid JSON");
        assert_eq!(parsed["hookSpecificOutput"]["decision"]["behavior"], "deny");
    }

    #[test]
    fn passthrough_and_unknown_produce_no_output() {
        assert!(decision_output(&json!({"action": "passthrough", "reason": "x"})).is_none());
        assert!(decision_output(&json!({"action": "launch", "reason": "x"})).is_none());
        assert!(decision_output(&json!({})).is_none());
    }

    #[test]
    fn notification_detection_matches_daemon_rule() {
        assert!(is_notification(&json!({"hook_event_name": "Notification"})));
        assert!(is_notification(&json!({"notification_type": "idle_prompt"})));
        assert!(!is_notification(
            &json!({"tool_name": "Bash", "tool_input": {}})
        ));
    }
}
