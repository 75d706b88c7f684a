// Copyright (c) 2026 Helmsman Authors
// SPDX-License-Identifier: AGPL-3.0
// Event Bus - Pub/Sub for Orchestration Trace Events
//
// In-memory event streaming over tokio broadcast channels. Publishing is
// fire-and-forget: a publish never blocks and never fails the caller, and
// events are advisory only.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::events::OrchestrationEvent;

/// Observability sink for orchestration trace events.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<OrchestrationEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    /// Capacity bounds how many events buffer before old ones are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender: Arc::new(sender) }
    }

    /// Default capacity (1000).
    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Publish an event to all subscribers. Never blocks, never fails.
    pub fn publish(&self, event: OrchestrationEvent) {
        debug!(?event, "publishing orchestration event");
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("no subscribers listening to event");
        }
    }

    /// Subscribe to all orchestration events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver { receiver: self.sender.subscribe() }
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<OrchestrationEvent>,
}

impl EventReceiver {
    /// Receive the next event; `None` when the bus is closed or lagged out.
    pub async fn recv(&mut self) -> Option<OrchestrationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event receiver lagged; skipping");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain any already-buffered events without waiting.
    pub fn try_drain(&mut self) -> Vec<OrchestrationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::SelectionReason;
    use chrono::Utc;

    #[tokio::test]
    async fn publish_without_subscribers_is_silent() {
        let bus = EventBus::with_default_capacity();
        bus.publish(OrchestrationEvent::TeamTurnStarted {
            team: "writers".into(),
            turn: 0,
            at: Utc::now(),
        });
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::with_default_capacity();
        let mut rx = bus.subscribe();
        bus.publish(OrchestrationEvent::TeamMemberSelected {
            team: "writers".into(),
            turn: 1,
            member: "critic".into(),
            reason: Some(SelectionReason::ExactMatch),
            at: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            OrchestrationEvent::TeamMemberSelected { ref member, .. } if member == "critic"
        ));
    }
}
