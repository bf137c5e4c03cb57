//! Polling idle backend for macOS: reads `HIDIdleTime` (nanoseconds since
//! last input) from `ioreg -c IOHIDSystem` about once a second and compares
//! it to the configured threshold.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{emit_transition, IdleBackend, POLL_INTERVAL};

pub struct MacIdleBackend {
    binary: String,
    idle_timeout: u64,
    events: mpsc::Sender<bool>,
    current_idle: bool,
    failed_polls: u32,
}

impl MacIdleBackend {
    pub fn new(binary: String, idle_timeout: u64, events: mpsc::Sender<bool>) -> Self {
        Self {
            binary,
            idle_timeout,
            events,
            current_idle: false,
            failed_polls: 0,
        }
    }

    /// Run ioreg once. `Err` means the binary itself could not run; `None`
    /// means it ran but the idle time could not be parsed.
    async fn query_idle_ns(&self) -> Result<Option<u64>> {
        let output = Command::new(&self.binary)
            .args(["-c", "IOHIDSystem"])
            .output()
            .await
            .with_context(|| format!("failed to execute '{}'", self.binary))?;

        if !output.status.success() {
            warn!(status = %output.status, "ioreg exited with an error");
            return Ok(None);
        }

        Ok(parse_hid_idle_time(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn note_idle_seconds(&mut self, idle_seconds: f64) {
        let is_idle = idle_seconds >= self.idle_timeout as f64;
        emit_transition(&mut self.current_idle, is_idle, &self.events).await;
    }
}

#[async_trait]
impl IdleBackend for MacIdleBackend {
    fn name(&self) -> &'static str {
        "ioreg"
    }

    async fn start(&mut self) -> Result<()> {
        // Probe once so a missing binary is a startup failure, not a silent
        // stream of warnings.
        self.query_idle_ns().await?;
        self.current_idle = false;
        self.failed_polls = 0;
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            match self.query_idle_ns().await {
                Ok(Some(idle_ns)) => {
                    self.failed_polls = 0;
                    let idle_seconds = idle_ns as f64 / 1_000_000_000.0;
                    debug!(idle_seconds, "ioreg poll");
                    self.note_idle_seconds(idle_seconds).await;
                }
                Ok(None) => {
                    self.failed_polls += 1;
                    if self.failed_polls % 60 == 1 {
                        warn!(
                            failed_polls = self.failed_polls,
                            "Could not read HIDIdleTime from ioreg output"
                        );
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn stop(&mut self) {}
}

/// Extract the HIDIdleTime value from ioreg output. The relevant line looks
/// like `"HIDIdleTime" = 12345678901`.
fn parse_hid_idle_time(output: &str) -> Option<u64> {
    for line in output.lines() {
        if !line.contains("\"HIDIdleTime\"") {
            continue;
        }
        let value = line.rsplit('=').next()?.trim();
        let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(ns) = digits.parse() {
            return Some(ns);
        }
    }
    None
}
