//! Polling idle backend for Windows over the native input-timing API:
//! `GetLastInputInfo` reports the tick of the last keyboard/mouse input.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use windows_sys::Win32::System::SystemInformation::GetTickCount;
use windows_sys::Win32::UI::Input::KeyboardAndMouse::{GetLastInputInfo, LASTINPUTINFO};

use super::{emit_transition, IdleBackend, POLL_INTERVAL};

pub struct WindowsIdleBackend {
    idle_timeout: u64,
    events: mpsc::Sender<bool>,
    current_idle: bool,
}

impl WindowsIdleBackend {
    pub fn new(idle_timeout: u64, events: mpsc::Sender<bool>) -> Self {
        Self {
            idle_timeout,
            events,
            current_idle: false,
        }
    }

    fn idle_seconds() -> Option<f64> {
        let mut info = LASTINPUTINFO {
            cbSize: std::mem::size_of::<LASTINPUTINFO>() as u32,
            dwTime: 0,
        };
        // SAFETY: info is a properly sized, initialized LASTINPUTINFO.
        let ok = unsafe { GetLastInputInfo(&mut info) };
        if ok == 0 {
            warn!("GetLastInputInfo failed");
            return None;
        }
        let now = unsafe { GetTickCount() };
        // wrapping_sub stays correct across the ~49.7 day tick rollover.
        let idle_ms = now.wrapping_sub(info.dwTime);
        Some(idle_ms as f64 / 1000.0)
    }
}

#[async_trait]
impl IdleBackend for WindowsIdleBackend {
    fn name(&self) -> &'static str {
        "windows-input"
    }

    async fn start(&mut self) -> Result<()> {
        if Self::idle_seconds().is_none() {
            anyhow::bail!("GetLastInputInfo is not available");
        }
        self.current_idle = false;
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Some(idle_seconds) = Self::idle_seconds() {
                debug!(idle_seconds, "input-timer poll");
                let is_idle = idle_seconds >= self.idle_timeout as f64;
                emit_transition(&mut self.current_idle, is_idle, &self.events).await;
            }
        }
    }

    async fn stop(&mut self) {}
}
