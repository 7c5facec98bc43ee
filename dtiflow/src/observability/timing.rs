//! Stage timing and span helpers.

use crate::core::StageId;
use std::time::{Duration, Instant};
use tracing::Span;

/// Wall-clock timer for one unit of work.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Elapsed time so far.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed seconds so far.
    #[must_use]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// The timer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the timer and returns elapsed seconds.
    #[must_use]
    pub fn finish(self) -> f64 {
        self.elapsed_secs()
    }
}

/// Span covering one subject's run.
#[must_use]
pub fn subject_span(subject: &str) -> Span {
    tracing::info_span!("subject", subject = %subject)
}

/// Span covering one stage of one subject.
#[must_use]
pub fn stage_span(subject: &str, stage: StageId) -> Span {
    tracing::info_span!("stage", subject = %subject, stage = %stage, contract = %stage.contract())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("refinement");
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.name(), "refinement");
        assert!(timer.elapsed() >= Duration::from_millis(5));
        assert!(timer.finish() >= 0.005);
    }

    #[test]
    fn test_spans_construct_without_subscriber() {
        let _s = subject_span("sub-001");
        let _t = stage_span("sub-001", StageId::MotionCorrection);
    }
}
