//! Abstract remote commands and telemetry.
//!
//! The messaging transport itself lives outside this crate; it hands over
//! parsed (command, payload) pairs and receives telemetry payloads. Command
//! names and the key table match what the device fleet already speaks, so
//! lookups are case-insensitive and unknown input is dropped rather than
//! answered with an error.

use serde::Serialize;
use tracing::info;

use crate::idle::IdleState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenCommand {
    On,
    Off,
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Screen(ScreenCommand),
    /// Injects a key press and release through the normal input path.
    Key { key: u32 },
    /// Injects relative encoder movement.
    Encoder { delta: i16 },
}

/// Key names accepted over the remote channel. The values are the
/// navigation codes the content producer understands.
const KEYS: &[(&str, u32)] = &[
    ("up", 17),
    ("down", 18),
    ("right", 19),
    ("left", 20),
    ("esc", 27),
    ("del", 127),
    ("backspace", 8),
    ("enter", 10),
    ("next", 9),
    ("prev", 11),
    ("previous", 11),
    ("home", 2),
    ("end", 3),
];

fn key_from_name(name: &str) -> Option<u32> {
    KEYS.iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|&(_, key)| key)
}

/// Parses one remote command. `None` for anything unknown; the transport
/// drops such messages silently.
pub fn parse_command(name: &str, payload: &str) -> Option<RemoteCommand> {
    if name.eq_ignore_ascii_case("screen") {
        let command = match payload.to_ascii_lowercase().as_str() {
            "on" => ScreenCommand::On,
            "off" => ScreenCommand::Off,
            "toggle" => ScreenCommand::Toggle,
            _ => return None,
        };
        return Some(RemoteCommand::Screen(command));
    }

    if name.eq_ignore_ascii_case("key") {
        let key = key_from_name(payload.trim())?;
        return Some(RemoteCommand::Key { key });
    }

    if name.eq_ignore_ascii_case("encoder") {
        let delta: i64 = payload.trim().parse().ok()?;
        if !(i64::from(i16::MIN)..=i64::from(i16::MAX)).contains(&delta) {
            return None;
        }
        return Some(RemoteCommand::Encoder {
            delta: delta as i16,
        });
    }

    None
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    IdleState { state: IdleState },
    Power { on: bool, supported: bool },
    FrameStats { blocking_waits: u64, completions: u64 },
}

/// Where device status reports go. The real transport implements this;
/// the default sink just logs.
pub trait Telemetry {
    fn publish(&mut self, event: &TelemetryEvent);
}

pub struct LogTelemetry;

impl Telemetry for LogTelemetry {
    fn publish(&mut self, event: &TelemetryEvent) {
        match serde_json::to_string(event) {
            Ok(payload) => info!(target: "telemetry", "{payload}"),
            Err(err) => info!(target: "telemetry", "unserializable event: {err}"),
        }
    }
}
