//! Event sink trait and implementations.

use super::ProgressEvent;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn, Level};

/// Trait for sinks that receive progress events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: ProgressEvent) {
        self.try_emit(&event);
    }

    /// Emits an event without blocking on anything but the write itself.
    ///
    /// Never fails; errors are logged and suppressed.
    fn try_emit(&self, event: &ProgressEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn try_emit(&self, _event: &ProgressEvent) {}
}

/// An event sink that forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn try_emit(&self, event: &ProgressEvent) {
        let subject = event.subject.as_deref().unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(subject, level = %event.level, stage = ?event.stage, duration_s = ?event.duration_s, "{}", event.msg);
        } else {
            info!(subject, level = %event.level, stage = ?event.stage, duration_s = ?event.duration_s, "{}", event.msg);
        }
    }
}

/// Appends one JSON object per line to a file.
///
/// Each line is written with a single `write_all` on an append-mode handle,
/// so concurrent writers never interleave within a line.
#[derive(Debug)]
pub struct JsonlEventSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlEventSink {
    /// Opens (creating if needed) the log file in append mode.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// The log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventSink {
    fn try_emit(&self, event: &ProgressEvent) {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Failed to serialize progress event");
                return;
            }
        };
        line.push(b'\n');
        if let Err(e) = self.file.lock().write_all(&line) {
            warn!(path = %self.path.display(), error = %e, "Failed to append progress event");
        }
    }
}

/// Forwards every event to several sinks.
#[derive(Default)]
pub struct FanoutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    /// Creates a fan-out over `sinks`.
    #[must_use]
    pub fn new(sinks: Vec<std::sync::Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl std::fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl EventSink for FanoutEventSink {
    fn try_emit(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.try_emit(event);
        }
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<ProgressEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns the TIMING events.
    #[must_use]
    pub fn timings(&self) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.is_timing())
            .cloned()
            .collect()
    }

    /// Returns events whose message contains `needle`.
    #[must_use]
    pub fn matching(&self, needle: &str) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.msg.contains(needle))
            .cloned()
            .collect()
    }
}

impl EventSink for CollectingEventSink {
    fn try_emit(&self, event: &ProgressEvent) {
        self.events.write().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageId;
    use crate::events::EventLevel;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpEventSink.emit(ProgressEvent::info(None, "start")).await;
        LoggingEventSink::default().try_emit(&ProgressEvent::warn(Some("sub-001"), "slow disk"));
        LoggingEventSink::debug().try_emit(&ProgressEvent::timing("sub-001", StageId::Refinement, 1.5));
    }

    #[test]
    fn test_jsonl_lines_parse_independently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/events.jsonl");
        let sink = JsonlEventSink::open(&path).unwrap();

        sink.try_emit(&ProgressEvent::info(Some("sub-001"), "Starting subject"));
        sink.try_emit(&ProgressEvent::timing("sub-001", StageId::MotionCorrection, 42.25));
        sink.try_emit(&ProgressEvent::error(Some("sub-002"), "eddy failed"));

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in &lines {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(value.get("ts").is_some());
            assert!(value.get("msg").is_some());
        }

        let timing: ProgressEvent = serde_json::from_str(lines[1]).unwrap();
        assert!(timing.is_timing());
        assert_eq!(timing.stage, Some(StageId::MotionCorrection));
        assert_eq!(timing.duration_s, Some(42.25));
        assert_eq!(timing.level, EventLevel::Info);
    }

    #[test]
    fn test_jsonl_appends_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");

        JsonlEventSink::open(&path).unwrap().try_emit(&ProgressEvent::info(None, "first"));
        JsonlEventSink::open(&path).unwrap().try_emit(&ProgressEvent::info(None, "second"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_jsonl_concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = Arc::new(JsonlEventSink::open(&path).unwrap());

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let sink = sink.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        sink.try_emit(&ProgressEvent::info(Some("sub-001"), format!("writer {t} line {i}")));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 200);
        for line in content.lines() {
            serde_json::from_str::<ProgressEvent>(line).unwrap();
        }
    }

    #[test]
    fn test_fanout_and_collecting() {
        let a = Arc::new(CollectingEventSink::new());
        let b = Arc::new(CollectingEventSink::new());
        let fanout = FanoutEventSink::new(vec![a.clone() as Arc<dyn EventSink>, b.clone()]);

        fanout.try_emit(&ProgressEvent::info(Some("sub-001"), "Stage basic_preprocessing completed"));
        fanout.try_emit(&ProgressEvent::timing("sub-001", StageId::BasicPreprocessing, 3.0));

        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 2);
        assert_eq!(a.timings().len(), 1);
        assert_eq!(a.matching("basic_preprocessing").len(), 1);
        assert!(!a.is_empty());
    }
}
