//! Daemon client protocol.
//!
//! Clients and the daemon exchange one JSON document per line. Clients send
//! commands shaped `{"command": "<name>", "args": {...}}`; the daemon answers
//! every command with a `reply` event and pushes asynchronous events to
//! clients that subscribed, shaped `{"event": "<name>", "data": {...}}`.
//!
//! ```text
//! → {"command":"authenticate","args":{"user":"alice","password":"secret"}}
//! ← {"event":"reply","data":{"command":"authenticate","ok":true,"message":"logged in as alice (user)"}}
//! → {"command":"run","args":{"code":"maw(\"m1\", 5.0)"}}
//! ← {"event":"reply","data":{"command":"run","ok":true,"message":"queued","id":1}}
//! ← {"event":"status","data":{"state":"running","script":1,"queue":0}}
//! ```

use super::script::ScriptState;
use crate::context::Mode;
use crate::error::{AppResult, IcsError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "lowercase")]
pub enum Command {
    Authenticate {
        user: String,
        /// Plain password or its hex digest.
        #[serde(default)]
        password: String,
    },
    /// Queue a script.
    Run {
        code: String,
        #[serde(default)]
        name: Option<String>,
    },
    /// Dry-run a script; `devices` get a min/max/last summary.
    Simulate {
        code: String,
        #[serde(default)]
        devices: Vec<String>,
    },
    /// Stop the running script, or remove a queued one by id.
    Stop {
        #[serde(default)]
        id: Option<u64>,
    },
    Pause,
    Resume,
    /// Start receiving asynchronous events.
    Subscribe,
    Unsubscribe,
    /// Request a `status` event.
    GetStatus,
    SetMode { mode: Mode },
    Help {
        #[serde(default)]
        topic: Option<String>,
    },
    Quit,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Authenticate { .. } => "authenticate",
            Command::Run { .. } => "run",
            Command::Simulate { .. } => "simulate",
            Command::Stop { .. } => "stop",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Subscribe => "subscribe",
            Command::Unsubscribe => "unsubscribe",
            Command::GetStatus => "getstatus",
            Command::SetMode { .. } => "setmode",
            Command::Help { .. } => "help",
            Command::Quit => "quit",
        }
    }

    pub fn decode(line: &str) -> AppResult<Self> {
        serde_json::from_str(line)
            .map_err(|err| IcsError::Protocol(format!("invalid command: {}", err)))
    }

    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Per-device result of a dry run, formatted with the device `fmtstr`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub name: String,
    pub min: Option<String>,
    pub max: Option<String>,
    pub last: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum Event {
    /// Answer to a command.
    Reply {
        command: String,
        ok: bool,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
    },
    Status {
        state: ScriptState,
        script: Option<u64>,
        queue: usize,
    },
    /// Log output of scripts and the daemon.
    Message {
        time: f64,
        level: String,
        text: String,
        #[serde(default)]
        script: Option<u64>,
    },
    /// Parameters of a starting acquisition.
    LiveParams {
        device: String,
        preset: f64,
        time: f64,
    },
    /// Result of an acquisition.
    LiveData {
        device: String,
        time: f64,
        value: Value,
    },
    ShowHelp { topic: String, text: String },
    Mode { mode: Mode },
    /// Final result of a dry run.
    Simulation {
        id: u64,
        elapsed: f64,
        devices: Vec<DeviceSummary>,
        #[serde(default)]
        error: Option<String>,
    },
}

impl Event {
    pub fn ok(command: &str, message: impl Into<String>) -> Self {
        Event::Reply {
            command: command.to_string(),
            ok: true,
            message: message.into(),
            id: None,
        }
    }

    pub fn error(command: &str, err: &IcsError) -> Self {
        Event::Reply {
            command: command.to_string(),
            ok: false,
            message: err.to_string(),
            id: None,
        }
    }

    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(line: &str) -> AppResult<Self> {
        serde_json::from_str(line).map_err(|err| IcsError::Protocol(format!("invalid event: {}", err)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_shapes() {
        let cmd = Command::decode(r#"{"command":"run","args":{"code":"print(1)"}}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Run {
                code: "print(1)".into(),
                name: None
            }
        );
        assert_eq!(Command::decode(r#"{"command":"pause"}"#).unwrap(), Command::Pause);
        let mode = Command::decode(r#"{"command":"setmode","args":{"mode":"slave"}}"#).unwrap();
        assert_eq!(mode, Command::SetMode { mode: Mode::Slave });
        assert!(Command::decode(r#"{"command":"explode"}"#).is_err());
    }

    #[test]
    fn test_event_shape() {
        let event = Event::Status {
            state: ScriptState::Running,
            script: Some(3),
            queue: 1,
        };
        let json: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"event": "status", "data": {"state": "running", "script": 3, "queue": 1}})
        );
        let live: Value = serde_json::to_value(Event::LiveData {
            device: "det".into(),
            time: 1.0,
            value: json!(5),
        })
        .unwrap();
        assert_eq!(live["event"], "livedata");
    }

    #[test]
    fn test_reply_without_id_omits_it() {
        let json = Event::ok("pause", "paused").encode().unwrap();
        assert!(!json.contains("\"id\""));
    }
}
