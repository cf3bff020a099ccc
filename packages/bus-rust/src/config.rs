use std::time::Duration;

/// Bus-level configuration for the built-in dispatch middleware.
///
/// Everything is off by default except tracing; a default bus adds no
/// deadlines and no concurrency limit.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Deadline applied to every dispatch. `None` disables the timeout middleware.
    pub dispatch_timeout: Option<Duration>,
    /// Maximum dispatches in flight before load shedding. `None` means unlimited.
    pub max_concurrent_dispatches: Option<u32>,
    /// Whether to wrap dispatches in `tracing` spans.
    pub trace_dispatches: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            dispatch_timeout: None,
            max_concurrent_dispatches: None,
            trace_dispatches: true,
        }
    }
}
