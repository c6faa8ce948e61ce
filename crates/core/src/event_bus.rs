//! Funnel event bus. Trait for emitting lifecycle events from any module.
//!
//! Engines accept an `Arc<dyn EventSink>` so enrollment and dispatch events
//! can be routed to analytics storage or the operator dashboard.

use crate::types::{EventType, FunnelEvent};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for emitting funnel events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FunnelEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FunnelEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FunnelEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<FunnelEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FunnelEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `FunnelEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    campaign_id: Option<Uuid>,
    customer_id: Option<&str>,
    stage_number: Option<u32>,
) -> FunnelEvent {
    FunnelEvent {
        event_id: Uuid::new_v4(),
        event_type,
        campaign_id,
        customer_id: customer_id.map(str::to_string),
        stage_number,
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let campaign = Uuid::new_v4();
        sink.emit(make_event(
            EventType::EnrollmentCreated,
            Some(campaign),
            Some("cust-1"),
            None,
        ));
        sink.emit(make_event(
            EventType::StageDispatched,
            Some(campaign),
            Some("cust-1"),
            Some(1),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::EnrollmentCreated), 1);
        assert_eq!(sink.count_type(EventType::StageDispatched), 1);

        let events = sink.events();
        assert_eq!(events[0].customer_id.as_deref(), Some("cust-1"));
        assert_eq!(events[1].stage_number, Some(1));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        sink.emit(make_event(EventType::MemberEntered, None, None, None));
    }
}
