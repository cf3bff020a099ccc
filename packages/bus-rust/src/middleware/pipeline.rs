//! Pipeline composition: builds the built-in middleware list from config.

use std::sync::Arc;

use super::load_shed::LoadShedMiddleware;
use super::timeout::TimeoutMiddleware;
use super::trace::TraceMiddleware;
use super::SharedMiddleware;
use crate::config::BusConfig;

/// Build the built-in middleware for a bus, outermost first.
///
/// Order:
/// 1. `LoadShedMiddleware` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutMiddleware` -- enforce the dispatch deadline
/// 3. `TraceMiddleware` -- record timing and outcome (closest to the handler)
///
/// Each entry is only present when enabled in `config`.
#[must_use]
pub fn build_dispatch_pipeline(config: &BusConfig) -> Vec<SharedMiddleware> {
    let mut pipeline: Vec<SharedMiddleware> = Vec::new();
    if let Some(limit) = config.max_concurrent_dispatches {
        pipeline.push(Arc::new(LoadShedMiddleware::new(limit)));
    }
    if let Some(timeout) = config.dispatch_timeout {
        pipeline.push(Arc::new(TimeoutMiddleware::new(timeout)));
    }
    if config.trace_dispatches {
        pipeline.push(Arc::new(TraceMiddleware));
    }
    pipeline
}
