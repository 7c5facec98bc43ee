//! Structured progress events.
//!
//! Every line of the event log is a [`ProgressEvent`]: `{ts, level, subject,
//! msg}`, with `stage` and `duration_s` added on TIMING events.

mod sink;

pub use sink::{
    CollectingEventSink, EventSink, FanoutEventSink, JsonlEventSink, LoggingEventSink,
    NoOpEventSink,
};

use crate::core::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Message carried by stage timing events.
pub const TIMING_MSG: &str = "TIMING";

/// Severity of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    /// Normal progress.
    Info,
    /// Degraded but continuing.
    Warn,
    /// A failure.
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One line of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// When the event was produced.
    pub ts: DateTime<Utc>,
    /// Severity.
    pub level: EventLevel,
    /// Subject, or `None` for run-level events.
    pub subject: Option<String>,
    /// Free-text message.
    pub msg: String,
    /// Stage, on TIMING events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageId>,
    /// Elapsed seconds, on TIMING events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
}

impl ProgressEvent {
    fn new(level: EventLevel, subject: Option<&str>, msg: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            subject: subject.map(String::from),
            msg: msg.into(),
            stage: None,
            duration_s: None,
        }
    }

    /// An informational event.
    #[must_use]
    pub fn info(subject: Option<&str>, msg: impl Into<String>) -> Self {
        Self::new(EventLevel::Info, subject, msg)
    }

    /// A warning event.
    #[must_use]
    pub fn warn(subject: Option<&str>, msg: impl Into<String>) -> Self {
        Self::new(EventLevel::Warn, subject, msg)
    }

    /// An error event.
    #[must_use]
    pub fn error(subject: Option<&str>, msg: impl Into<String>) -> Self {
        Self::new(EventLevel::Error, subject, msg)
    }

    /// A stage timing event.
    #[must_use]
    pub fn timing(subject: &str, stage: StageId, duration_s: f64) -> Self {
        Self {
            stage: Some(stage),
            duration_s: Some(duration_s),
            ..Self::new(EventLevel::Info, Some(subject), TIMING_MSG)
        }
    }

    /// Returns true for TIMING events.
    #[must_use]
    pub fn is_timing(&self) -> bool {
        self.msg == TIMING_MSG && self.duration_s.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_event_shape() {
        let event = ProgressEvent::warn(Some("sub-003"), "Refinement quality acceptable");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["level"], "WARN");
        assert_eq!(json["subject"], "sub-003");
        assert!(json.get("stage").is_none());
        assert!(json.get("duration_s").is_none());
    }

    #[test]
    fn test_timing_event_shape() {
        let event = ProgressEvent::timing("sub-001", StageId::Connectivity, 3600.5);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["msg"], "TIMING");
        assert_eq!(json["stage"], "connectivity");
        assert_eq!(json["duration_s"], 3600.5);
        assert!(event.is_timing());
    }

    #[test]
    fn test_run_level_event_has_null_subject() {
        let json = serde_json::to_value(ProgressEvent::info(None, "Run started")).unwrap();
        assert!(json["subject"].is_null());
    }
}
