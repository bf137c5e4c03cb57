//! permitd bridges local tool permission prompts to Slack while the user is
//! away from the machine.
//!
//! A short-lived hook forwards each prompt over a local socket; if the user
//! is idle the daemon posts an interactive card to Slack and relays the
//! button decision back, and the moment the user returns (or the hook goes
//! away) any in-flight card is retired. When in doubt the daemon always
//! yields to the local prompt: no trace ever approves or denies without a
//! button press.

pub mod config;
pub mod coordinator;
pub mod idle;
pub mod ipc;
pub mod protocol;
pub mod slack;
pub mod state;
