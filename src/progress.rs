//! Pass progress events and their wire form.
//!
//! The fetch pipeline emits [`ProgressEvent`]s; the broker fans them out as
//! [`Notification`]s, whose JSON shape is fixed:
//!
//! ```json
//! {"event":"onProgress","data":42.5}
//! {"event":"onDone","isDone":true}
//! {"event":"onStop","isStopped":true}
//! ```
//!
//! The CLI renders notifications on **stderr** (human or JSON lines) so
//! stdout stays parseable for scripts.

use std::io::Write;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::traits::NotificationTransport;

/// One event of a fetch pass or sync loop.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// A page was committed. `upserted` is cumulative for this pass.
    Progress { percent: f64, upserted: u64 },
    /// The pass finished every channel.
    Done,
    /// The sync loop stopped.
    Stopped,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Done | ProgressEvent::Stopped)
    }
}

/// Broker payload, serialised with the event name as the `event` field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Notification {
    #[serde(rename = "onProgress")]
    Progress { data: f64 },
    #[serde(rename = "onDone")]
    Done {
        #[serde(rename = "isDone")]
        is_done: bool,
    },
    #[serde(rename = "onStop")]
    Stopped {
        #[serde(rename = "isStopped")]
        is_stopped: bool,
    },
}

impl Notification {
    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::Progress { .. } => "onProgress",
            Notification::Done { .. } => "onDone",
            Notification::Stopped { .. } => "onStop",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Notification::Progress { .. })
    }
}

impl From<ProgressEvent> for Notification {
    fn from(event: ProgressEvent) -> Self {
        match event {
            ProgressEvent::Progress { percent, .. } => Notification::Progress { data: percent },
            ProgressEvent::Done => Notification::Done { is_done: true },
            ProgressEvent::Stopped => Notification::Stopped { is_stopped: true },
        }
    }
}

/// Human-friendly lines on stderr: `sync  progress  42.5%`.
pub struct StderrTransport;

#[async_trait]
impl NotificationTransport for StderrTransport {
    async fn publish(&self, notification: &Notification) -> Result<()> {
        let line = match notification {
            Notification::Progress { data } => format!("sync  progress  {:.1}%\n", data),
            Notification::Done { .. } => "sync  done\n".to_string(),
            Notification::Stopped { .. } => "sync  stopped\n".to_string(),
        };
        let mut stderr = std::io::stderr().lock();
        stderr.write_all(line.as_bytes())?;
        stderr.flush()?;
        Ok(())
    }
}

/// Machine-readable progress: one JSON notification per line on stderr.
pub struct JsonTransport;

#[async_trait]
impl NotificationTransport for JsonTransport {
    async fn publish(&self, notification: &Notification) -> Result<()> {
        let line = serde_json::to_string(notification)?;
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "{}", line)?;
        stderr.flush()?;
        Ok(())
    }
}

/// Drops every notification.
pub struct NoTransport;

#[async_trait]
impl NotificationTransport for NoTransport {
    async fn publish(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn transport(&self) -> Box<dyn NotificationTransport> {
        match self {
            ProgressMode::Off => Box::new(NoTransport),
            ProgressMode::Human => Box::new(StderrTransport),
            ProgressMode::Json => Box::new(JsonTransport),
        }
    }
}
