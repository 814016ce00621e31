//! Events the supervisor exposes to its presentation and notification collaborators.
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use strum_macros::AsRefStr;

use crate::registry::ScriptStatus;

/// Severity of a [`SupervisorEvent::Notice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Something observable happened on the coordination point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisorEvent {
    /// A script's process record changed state.
    StatusChanged {
        name: String,
        status: ScriptStatus,
        pid: Option<u32>,
    },
    /// A chunk of output was read from a script. Newline-terminated unless it
    /// is the trailing remainder of the stream.
    OutputLine { name: String, text: String },
    /// Aggregated CPU usage of one script's process tree for the last period.
    CpuSample {
        name: String,
        percent: f32,
        history: Vec<f32>,
    },
    /// Sum of all managed scripts' CPU usage for the last period.
    TotalCpu { percent: f32 },
    /// Lifecycle message suitable for a desktop notification.
    Notice {
        name: Option<String>,
        level: NoticeLevel,
        message: String,
    },
}

/// Sending half of the event stream. Emitting never fails: events are dropped
/// once the receiver has gone away.
#[derive(Debug, Clone)]
pub(crate) struct EventSink(Sender<SupervisorEvent>);

impl EventSink {
    pub(crate) fn emit(&self, event: SupervisorEvent) {
        let _ = self.0.send(event);
    }

    pub(crate) fn notice(&self, name: &str, level: NoticeLevel, message: String) {
        self.emit(SupervisorEvent::Notice {
            name: Some(name.to_string()),
            level,
            message,
        });
    }
}

pub(crate) fn channel() -> (EventSink, Receiver<SupervisorEvent>) {
    let (tx, rx) = mpsc::channel();
    (EventSink(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tags() {
        let event = SupervisorEvent::StatusChanged {
            name: "web".into(),
            status: ScriptStatus::Error("boom".into()),
            pid: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["status"]["state"], "error");
        assert_eq!(json["status"]["reason"], "boom");

        let notice = SupervisorEvent::Notice {
            name: None,
            level: NoticeLevel::Warning,
            message: "careful".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["level"], "warning");
    }

    #[test]
    fn emit_after_receiver_dropped_is_silent() {
        let (sink, rx) = channel();
        drop(rx);
        sink.emit(SupervisorEvent::TotalCpu { percent: 1.0 });
    }
}
