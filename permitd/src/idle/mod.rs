//! User idle detection.
//!
//! Each platform backend turns its native signal (a swayidle subprocess, an
//! ioreg poll, a GetLastInputInfo poll) into a deduplicated stream of
//! idle/active transitions on an mpsc channel. The daemon never re-derives
//! idleness itself; the backend's transitions are authoritative.

mod macos;
mod swayidle;
#[cfg(windows)]
mod windows;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

pub use macos::MacIdleBackend;
pub use swayidle::SwayidleBackend;
#[cfg(windows)]
pub use windows::WindowsIdleBackend;

use crate::config::Config;

/// Poll cadence shared by the polling backends.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[async_trait]
pub trait IdleBackend: Send {
    fn name(&self) -> &'static str;

    /// Acquire whatever the backend needs (spawn the helper process, probe
    /// the system API). Must fail loudly if the backend cannot work here.
    async fn start(&mut self) -> Result<()>;

    /// Produce transitions until stopped. Returning `Err` means the backend
    /// crashed; the supervisor decides what happens next.
    async fn run(&mut self) -> Result<()>;

    async fn stop(&mut self);
}

/// Pick the backend for the host OS. Anything else is a startup failure:
/// without idle detection the daemon would never forward a request.
#[cfg(target_os = "linux")]
pub fn create_backend(
    config: &Config,
    events: mpsc::Sender<bool>,
) -> Result<Box<dyn IdleBackend>> {
    info!("Using swayidle idle backend");
    Ok(Box::new(SwayidleBackend::new(
        config.swayidle.binary.clone(),
        config.daemon.idle_timeout,
        events,
    )))
}

#[cfg(target_os = "macos")]
pub fn create_backend(
    config: &Config,
    events: mpsc::Sender<bool>,
) -> Result<Box<dyn IdleBackend>> {
    info!("Using ioreg idle backend");
    Ok(Box::new(MacIdleBackend::new(
        config.mac.binary.clone(),
        config.daemon.idle_timeout,
        events,
    )))
}

#[cfg(windows)]
pub fn create_backend(
    config: &Config,
    events: mpsc::Sender<bool>,
) -> Result<Box<dyn IdleBackend>> {
    info!("Using GetLastInputInfo idle backend");
    Ok(Box::new(WindowsIdleBackend::new(
        config.daemon.idle_timeout,
        events,
    )))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
pub fn create_backend(
    _config: &Config,
    _events: mpsc::Sender<bool>,
) -> Result<Box<dyn IdleBackend>> {
    anyhow::bail!(
        "no idle detection backend for this platform \
         (supported: Linux via swayidle, macOS via ioreg, Windows via GetLastInputInfo)"
    )
}

/// Drive a backend, failing open on trouble: a crash reports the user as
/// active (the local prompt is always the safe default), gets one restart,
/// and a second failure degrades to permanent active.
pub async fn supervise(mut backend: Box<dyn IdleBackend>, events: mpsc::Sender<bool>) {
    let mut restarted = false;
    loop {
        match backend.start().await {
            Ok(()) => match backend.run().await {
                Ok(()) => {
                    info!(backend = backend.name(), "Idle backend stopped");
                    return;
                }
                Err(err) => {
                    warn!(backend = backend.name(), "Idle backend crashed: {:#}", err);
                    backend.stop().await;
                }
            },
            Err(err) => {
                error!(backend = backend.name(), "Idle backend failed to start: {:#}", err);
            }
        }

        let _ = events.send(false).await;

        if restarted {
            error!(
                backend = backend.name(),
                "Idle backend failed repeatedly; treating user as permanently active"
            );
            return;
        }
        restarted = true;
        warn!(backend = backend.name(), "Restarting idle backend");
    }
}

/// Shared transition dedupe: backends call this on every observation and an
/// event is emitted only on a real state change.
pub(crate) async fn emit_transition(
    current_idle: &mut bool,
    is_idle: bool,
    events: &mpsc::Sender<bool>,
) {
    if *current_idle == is_idle {
        return;
    }
    *current_idle = is_idle;
    if is_idle {
        info!("User is now idle");
    } else {
        info!("User is now active");
    }
    let _ = events.send(is_idle).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyBackend;

    #[async_trait]
    impl IdleBackend for FlakyBackend {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn start(&mut self) -> Result<()> {
            Ok(())
        }

        async fn run(&mut self) -> Result<()> {
            anyhow::bail!("backend exploded")
        }

        async fn stop(&mut self) {}
    }

    #[tokio::test]
    async fn supervisor_fails_open_and_restarts_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let backend = Box::new(FlakyBackend);
        supervise(backend, tx).await;

        // One fail-open emission per crash: initial run plus one restart.
        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn emit_transition_dedupes_consecutive_states() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut current = false;

        emit_transition(&mut current, false, &tx).await;
        emit_transition(&mut current, true, &tx).await;
        emit_transition(&mut current, true, &tx).await;
        emit_transition(&mut current, false, &tx).await;
        drop(tx);

        assert_eq!(rx.recv().await, Some(true));
        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(rx.recv().await, None);
    }
}
