use std::fmt::Debug;

use anyhow::Result;
use parking_lot::Mutex;

/// A lightweight sink for typed events emitted by the engine. The event
/// schema is chosen by the producer.
pub trait TelemetrySink<Event>: Send + Sync {
    /// Record an event produced by the component.
    fn record(&self, event: &Event) -> Result<()>;

    /// Flush any buffered telemetry data to its destination.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// A telemetry sink that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl<Event> TelemetrySink<Event> for NoopTelemetry {
    fn record(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

/// Forwards every event to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl<Event: Debug> TelemetrySink<Event> for TracingTelemetry {
    fn record(&self, event: &Event) -> Result<()> {
        tracing::debug!(target: "wsbox::events", ?event, "event");
        Ok(())
    }
}

/// Buffers events in memory so tests can inspect what was emitted.
#[derive(Debug)]
pub struct MemoryTelemetry<Event> {
    events: Mutex<Vec<Event>>,
}

impl<Event> Default for MemoryTelemetry<Event> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<Event: Clone> MemoryTelemetry<Event> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl<Event: Clone + Send> TelemetrySink<Event> for MemoryTelemetry<Event> {
    fn record(&self, event: &Event) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemoryTelemetry::<u32>::new();
        sink.record(&1).ok();
        sink.record(&2).ok();
        assert_eq!(sink.events(), vec![1, 2]);
        assert!(sink.flush().is_ok());
    }
}
