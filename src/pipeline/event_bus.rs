// src/pipeline/event_bus.rs
//
// Session event stream. Subsystems publish events instead of reaching into
// each other's state; subscribers get a tokio broadcast receiver, and a short
// history is kept for late joiners.

use crate::detection::{ExpiryReason, Transition};
use crate::types::{DispatchAttempt, Incident, SessionId};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    IncidentOpened(Incident),
    IncidentConfirmed(Incident),
    IncidentDispatched(Incident),
    IncidentEscalated(Incident),
    IncidentAcknowledged(Incident),
    IncidentExpired {
        incident: Incident,
        reason: ExpiryReason,
    },
    IncidentCancelled(Incident),
    DispatchAttemptRecorded(DispatchAttempt),
    SourceDegraded {
        reason: String,
    },
    SessionStopped {
        session_id: SessionId,
    },
}

impl From<&Transition> for SessionEvent {
    fn from(t: &Transition) -> Self {
        match t {
            Transition::Opened(i) => SessionEvent::IncidentOpened(i.clone()),
            Transition::Cancelled(i) => SessionEvent::IncidentCancelled(i.clone()),
            Transition::Confirmed(i) => SessionEvent::IncidentConfirmed(i.clone()),
            Transition::Dispatched(i) => SessionEvent::IncidentDispatched(i.clone()),
            Transition::Escalate(i) => SessionEvent::IncidentEscalated(i.clone()),
            Transition::Acknowledged(i) => SessionEvent::IncidentAcknowledged(i.clone()),
            Transition::Expired { incident, reason } => SessionEvent::IncidentExpired {
                incident: incident.clone(),
                reason: *reason,
            },
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
    history: Mutex<VecDeque<SessionEvent>>,
    max_history: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            max_history: capacity,
        }
    }

    pub fn publish(&self, event: SessionEvent) {
        {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            if history.len() >= self.max_history {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        if self.sender.send(event).is_err() {
            debug!("No subscribers for session event");
        }
    }

    /// Slow subscribers lag and skip ahead; they never block publishers.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// The most recent events, oldest first.
    pub fn recent(&self) -> Vec<SessionEvent> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Logs a lagged receiver instead of failing the consumer loop.
pub fn log_lag(skipped: u64) {
    warn!("Event subscriber lagged, {} events skipped", skipped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Classification, IncidentId};

    fn incident(id: u64) -> Incident {
        Incident::open(IncidentId(id), &Classification::new(1, 0, 0.5, 0.3, 0.7))
    }

    #[test]
    fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::IncidentOpened(incident(1)));
        bus.publish(SessionEvent::SourceDegraded {
            reason: "camera lost".to_string(),
        });

        assert_eq!(rx.try_recv().unwrap(), SessionEvent::IncidentOpened(incident(1)));
        assert!(matches!(rx.try_recv().unwrap(), SessionEvent::SourceDegraded { .. }));
    }

    #[test]
    fn history_keeps_only_the_newest_events() {
        let bus = EventBus::new(3);
        for id in 1..=5 {
            bus.publish(SessionEvent::IncidentOpened(incident(id)));
        }
        let ids: Vec<u64> = bus
            .recent()
            .iter()
            .map(|e| match e {
                SessionEvent::IncidentOpened(i) => i.id.0,
                _ => 0,
            })
            .collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SessionEvent::from(&Transition::Expired {
            incident: incident(9),
            reason: ExpiryReason::AckTimeout,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "incident_expired");
        assert_eq!(json["reason"], "ack_timeout");
        assert_eq!(json["incident"]["id"], 9);

        let json = serde_json::to_value(SessionEvent::IncidentOpened(incident(2))).unwrap();
        assert_eq!(json["type"], "incident_opened");
        assert_eq!(json["status"], "pending");
    }
}
