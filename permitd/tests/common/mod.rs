//! Shared fixtures for integration tests: a recording chat fake and
//! in-memory hook connections.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

use permitd::ipc::HookConn;
use permitd::protocol::{Notification, PermissionRequest, PermissionResponse};
use permitd::slack::{ChatHandle, ChatPort, Outcome};

/// ChatPort fake that records every call and can simulate an outage.
#[derive(Default)]
pub struct FakeChat {
    pub posts: Mutex<Vec<PermissionRequest>>,
    pub notifications: Mutex<Vec<Notification>>,
    pub updates: Mutex<Vec<(String, Outcome)>>,
    pub fail_posts: AtomicBool,
    counter: AtomicUsize,
}

impl FakeChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn updates_for(&self, request_id: &str) -> Vec<Outcome> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == request_id)
            .map(|(_, outcome)| *outcome)
            .collect()
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }

    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn notification_count(&self) -> usize {
        self.notifications.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatPort for FakeChat {
    async fn post_request(&self, request: &PermissionRequest) -> Result<ChatHandle> {
        if self.fail_posts.load(Ordering::SeqCst) {
            anyhow::bail!("simulated chat outage");
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        self.posts.lock().unwrap().push(request.clone());
        Ok(ChatHandle {
            channel: "C-test".to_string(),
            ts: format!("ts-{n}"),
        })
    }

    async fn post_notification(&self, notification: &Notification) -> Result<()> {
        if self.fail_posts.load(Ordering::SeqCst) {
            anyhow::bail!("simulated chat outage");
        }
        self.notifications.lock().unwrap().push(notification.clone());
        Ok(())
    }

    async fn update_resolved(
        &self,
        _handle: &ChatHandle,
        request: &PermissionRequest,
        outcome: Outcome,
    ) -> Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((request.request_id.clone(), outcome));
        Ok(())
    }
}

pub fn request(request_id: &str, tool_name: &str, tool_input: Value) -> PermissionRequest {
    PermissionRequest {
        request_id: request_id.to_string(),
        tool_name: tool_name.to_string(),
        tool_input,
    }
}

pub fn notification(notification_type: &str, message: &str) -> Notification {
    Notification {
        notification_id: format!("n-{notification_type}"),
        notification_type: notification_type.to_string(),
        message: message.to_string(),
        cwd: None,
        received_at: chrono::Local::now(),
    }
}

/// An in-memory hook connection; the returned stream plays the hook's side.
pub fn hook_pair() -> (DuplexStream, HookConn) {
    let (client, server) = tokio::io::duplex(4096);
    let (reader, writer) = tokio::io::split(server);
    (
        client,
        HookConn {
            reader: Box::new(reader),
            writer: Box::new(writer),
        },
    )
}

pub async fn read_response(client: &mut DuplexStream) -> PermissionResponse {
    let mut reader = BufReader::new(client);
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .expect("read hook response");
    serde_json::from_str(line.trim()).expect("parse hook response")
}

/// Poll until a condition holds; the watcher and timeout paths resolve on
/// spawned tasks, so tests cannot assert immediately after the trigger.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
