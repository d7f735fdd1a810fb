//! Per-operation request tracing with bounded retention.
//!
//! Each incoming service operation opens a trace under a minted id; the
//! service appends `event` and `error` entries as it progresses and closes
//! the trace with `end`. Retention is bounded both by count (`max_traces`,
//! oldest evicted) and by age (`trace_retention_s`, removed during cleanup).
//! The trace id doubles as the correlation id attached to error payloads.

use crate::libs::config::TracerConfig;
use crate::libs::ident::IdGenerator;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;

/// Entry kinds recorded within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceEventKind {
    Start,
    Event,
    End,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub kind: TraceEventKind,
    pub message: String,
    pub at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub id: String,
    pub operation: String,
    pub started_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_ms: Option<i64>,
    pub errored: bool,
    pub events: Vec<TraceEvent>,
    /// Events dropped after `max_events_per_trace` was reached.
    pub dropped_events: usize,
}

/// Aggregate statistics over retained traces.
#[derive(Debug, Clone, Serialize)]
pub struct TraceSummary {
    pub count: usize,
    pub completed: usize,
    pub avg_duration_ms: f64,
    pub error_rate: f64,
}

struct TracerInner {
    traces: VecDeque<Trace>,
}

/// Bounded request tracer. Single writer lock; entry points are short
/// critical sections.
pub struct Tracer {
    config: TracerConfig,
    ids: IdGenerator,
    inner: Mutex<TracerInner>,
}

impl Tracer {
    pub fn new(config: TracerConfig) -> Self {
        Self {
            config,
            ids: IdGenerator::new(),
            inner: Mutex::new(TracerInner { traces: VecDeque::new() }),
        }
    }

    /// Opens a trace and returns its id (also the correlation id).
    pub fn start(&self, operation: &str) -> String {
        let id = self.ids.mint("trace");
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock();

        while inner.traces.len() >= self.config.max_traces && self.config.max_traces > 0 {
            inner.traces.pop_front();
        }

        inner.traces.push_back(Trace {
            id: id.clone(),
            operation: operation.to_string(),
            started_ms: now,
            ended_ms: None,
            errored: false,
            events: vec![TraceEvent {
                kind: TraceEventKind::Start,
                message: operation.to_string(),
                at_ms: now,
            }],
            dropped_events: 0,
        });

        id
    }

    /// Appends a progress event. Unknown trace ids are ignored (the trace
    /// may have been evicted).
    pub fn event(&self, trace_id: &str, message: &str) {
        self.append(trace_id, TraceEventKind::Event, message);
    }

    /// Appends an error event and marks the trace errored.
    pub fn error(&self, trace_id: &str, message: &str) {
        let mut inner = self.inner.lock();
        if let Some(trace) = inner.traces.iter_mut().find(|t| t.id == trace_id) {
            trace.errored = true;
        }
        drop(inner);
        self.append(trace_id, TraceEventKind::Error, message);
    }

    /// Closes a trace.
    pub fn end(&self, trace_id: &str) {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.inner.lock();
        if let Some(trace) = inner.traces.iter_mut().find(|t| t.id == trace_id) {
            trace.ended_ms = Some(now);
            trace.events.push(TraceEvent {
                kind: TraceEventKind::End,
                message: String::new(),
                at_ms: now,
            });
        }
    }

    fn append(&self, trace_id: &str, kind: TraceEventKind, message: &str) {
        let max_events = self.config.max_events_per_trace;
        let mut inner = self.inner.lock();
        if let Some(trace) = inner.traces.iter_mut().find(|t| t.id == trace_id) {
            if trace.events.len() >= max_events && max_events > 0 {
                trace.dropped_events += 1;
                return;
            }
            trace.events.push(TraceEvent {
                kind,
                message: message.to_string(),
                at_ms: Utc::now().timestamp_millis(),
            });
        }
    }

    /// Drops traces older than the retention window. Returns how many were
    /// removed. Invoked from the maintenance loop on `cleanup_interval_s`.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now().timestamp_millis() - (self.config.trace_retention_s as i64) * 1000;
        let mut inner = self.inner.lock();
        let before = inner.traces.len();
        inner.traces.retain(|t| t.started_ms >= cutoff);
        before - inner.traces.len()
    }

    /// Returns a copy of a retained trace.
    pub fn get(&self, trace_id: &str) -> Option<Trace> {
        self.inner.lock().traces.iter().find(|t| t.id == trace_id).cloned()
    }

    pub fn summary(&self) -> TraceSummary {
        let inner = self.inner.lock();
        let count = inner.traces.len();
        let completed: Vec<&Trace> = inner.traces.iter().filter(|t| t.ended_ms.is_some()).collect();
        let total_duration: i64 = completed.iter().map(|t| t.ended_ms.unwrap_or(t.started_ms) - t.started_ms).sum();
        let errored = inner.traces.iter().filter(|t| t.errored).count();

        TraceSummary {
            count,
            completed: completed.len(),
            avg_duration_ms: if completed.is_empty() {
                0.0
            } else {
                total_duration as f64 / completed.len() as f64
            },
            error_rate: if count == 0 { 0.0 } else { errored as f64 / count as f64 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer(max_traces: usize, max_events: usize) -> Tracer {
        Tracer::new(TracerConfig {
            max_traces,
            max_events_per_trace: max_events,
            trace_retention_s: 3600,
            cleanup_interval_s: 3600,
        })
    }

    #[test]
    fn trace_lifecycle() {
        let tracer = tracer(10, 100);
        let id = tracer.start("create_task");
        tracer.event(&id, "validated");
        tracer.end(&id);

        let trace = tracer.get(&id).unwrap();
        assert_eq!(trace.operation, "create_task");
        assert!(trace.ended_ms.is_some());
        assert!(!trace.errored);
        assert_eq!(trace.events.len(), 3); // start + event + end
    }

    #[test]
    fn oldest_evicted_on_overflow() {
        let tracer = tracer(2, 100);
        let first = tracer.start("a");
        tracer.start("b");
        tracer.start("c");

        assert!(tracer.get(&first).is_none());
        assert_eq!(tracer.summary().count, 2);
    }

    #[test]
    fn events_bounded_per_trace() {
        let tracer = tracer(10, 3);
        let id = tracer.start("busy");
        for i in 0..10 {
            tracer.event(&id, &format!("step {i}"));
        }

        let trace = tracer.get(&id).unwrap();
        assert_eq!(trace.events.len(), 3);
        assert_eq!(trace.dropped_events, 8);
    }

    #[test]
    fn error_marks_trace_and_counts_in_summary() {
        let tracer = tracer(10, 100);
        let ok = tracer.start("fine");
        tracer.end(&ok);
        let bad = tracer.start("broken");
        tracer.error(&bad, "storage error");
        tracer.end(&bad);

        let summary = tracer.summary();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.completed, 2);
        assert!((summary.error_rate - 0.5).abs() < f64::EPSILON);
    }
}
