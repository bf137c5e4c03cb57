//! Event-driven idle backend for Linux: a swayidle subprocess configured to
//! print `IDLE`/`ACTIVE` on its stdout as the user crosses the threshold.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{emit_transition, IdleBackend};

pub struct SwayidleBackend {
    binary: String,
    idle_timeout: u64,
    events: mpsc::Sender<bool>,
    child: Option<Child>,
    stdout: Option<BufReader<ChildStdout>>,
    current_idle: bool,
}

impl SwayidleBackend {
    pub fn new(binary: String, idle_timeout: u64, events: mpsc::Sender<bool>) -> Self {
        Self {
            binary,
            idle_timeout,
            events,
            child: None,
            stdout: None,
            current_idle: false,
        }
    }

    async fn handle_line(&mut self, line: &str) {
        match line {
            "IDLE" => emit_transition(&mut self.current_idle, true, &self.events).await,
            "ACTIVE" => emit_transition(&mut self.current_idle, false, &self.events).await,
            other => warn!(output = %other, "Unexpected swayidle output"),
        }
    }
}

#[async_trait]
impl IdleBackend for SwayidleBackend {
    fn name(&self) -> &'static str {
        "swayidle"
    }

    async fn start(&mut self) -> Result<()> {
        let timeout = self.idle_timeout.to_string();
        info!(binary = %self.binary, idle_timeout = %timeout, "Starting swayidle");

        let mut child = Command::new(&self.binary)
            .args(["-w", "timeout", &timeout, "echo IDLE", "resume", "echo ACTIVE"])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn swayidle binary '{}'", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .context("swayidle spawned without a stdout pipe")?;

        // Surface swayidle's own complaints; the task ends at pipe EOF.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(line = %line, "swayidle stderr");
                    }
                }
            });
        }

        self.stdout = Some(BufReader::new(stdout));
        self.child = Some(child);
        self.current_idle = false;
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let mut stdout = self.stdout.take().context("swayidle not started")?;
        let mut line = String::new();
        loop {
            line.clear();
            let read = stdout
                .read_line(&mut line)
                .await
                .context("failed to read swayidle stdout")?;
            if read == 0 {
                anyhow::bail!("swayidle exited unexpectedly");
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            debug!(output = %text, "swayidle stdout");
            self.handle_line(text).await;
        }
    }

    async fn stop(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            if child.try_wait().ok().flatten().is_none() {
                info!("Terminating swayidle subprocess");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }
}
