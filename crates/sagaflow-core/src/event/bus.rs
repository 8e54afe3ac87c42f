//! Broadcast event bus for distributing `WorkflowEvent` to subscribers.
//!
//! Built on `tokio::sync::broadcast`: delivery is fire-and-forget, publishing
//! with no active subscribers is a no-op, and a subscriber that falls more
//! than `capacity` events behind observes `Lagged` rather than blocking the
//! executor.

use sagaflow_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Multi-consumer event bus for workflow lifecycle events.
///
/// Cloning the bus clones the sender, so the executor and its spawned step
/// tasks all publish into the same channel.
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity (clamped to 1).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: WorkflowEvent) {
        tracing::trace!(instance_id = event.instance_id(), ?event, "publishing workflow event");
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_started(step_id: &str) -> WorkflowEvent {
        WorkflowEvent::StepStarted {
            instance_id: "wf-1".to_string(),
            step_id: step_id.to_string(),
            step_name: step_id.to_string(),
        }
    }

    #[tokio::test]
    async fn publish_and_subscribe_delivers_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(step_started("fetch"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.step_id(), Some("fetch"));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_event() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(step_started("fetch"));

        assert!(matches!(rx1.recv().await.unwrap(), WorkflowEvent::StepStarted { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), WorkflowEvent::StepStarted { .. }));
    }

    #[test]
    fn publish_with_no_subscribers_is_noop() {
        let bus = EventBus::new(16);
        bus.publish(step_started("a"));
        assert_eq!(bus.receiver_count(), 0);
    }

    #[test]
    fn lagged_receiver_reports_lag() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        for i in 0..10 {
            bus.publish(step_started(&format!("step-{i}")));
        }

        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert_eq!(n, 6),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn clone_shares_channel() {
        let bus = EventBus::new(16);
        let bus2 = bus.clone();
        let mut rx = bus.subscribe();

        bus2.publish(step_started("a"));

        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn debug_impl() {
        let bus = EventBus::default();
        let _rx = bus.subscribe();
        let debug = format!("{bus:?}");
        assert!(debug.contains("EventBus"));
        assert!(debug.contains("receiver_count: 1"));
    }
}
