//! Logging setup and timing helpers.

mod logging;
mod timing;

pub use logging::{build_filter, init_logging, DEFAULT_LOG_FILTER};
pub use timing::{stage_span, subject_span, SpanTimer};
