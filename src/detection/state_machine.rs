// src/detection/state_machine.rs
//
// Incident lifecycle.
//
//   Idle ──non-normal──▶ Watching ──N in a row──▶ Confirming ──impact / severity──▶ Confirmed
//     ▲                     │ window elapsed            │ confirm window elapsed          │ first attempt sent
//     │                     ▼                           ▼                                 ▼
//     └──────────────── Cancelled ◀─────────────────────┘                             Dispatched
//     ▲                                                                                   │
//     └──────────── Acknowledged / Expired ◀──── ack / escalations spent / plan exhausted ┘
//
// Purely reactive. Every input carries a timestamp from the session clock and
// all windows are timestamp comparisons, so nothing here sleeps or schedules.
// Opening Watching is cheap; reaching Confirmed needs a second, stronger signal.

use crate::clock::{ms_to_micros, Micros};
use crate::config::IncidentConfig;
use crate::geo::GeoPoint;
use crate::types::{Classification, EndpointId, Incident, IncidentId, IncidentStatus, Label};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionPhase {
    Idle,
    Watching,
    Confirming,
    Confirmed,
    Dispatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    /// Every escalation was spent without an acknowledgment.
    AckTimeout,
    /// The notifier ran out of endpoints and attempts.
    DispatchExhausted,
}

/// What a single input changed. Every variant carries the incident as it is
/// after the change.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Opened(Incident),
    Cancelled(Incident),
    Confirmed(Incident),
    Dispatched(Incident),
    /// Ack timeout elapsed: send the next attempt.
    Escalate(Incident),
    Acknowledged(Incident),
    Expired {
        incident: Incident,
        reason: ExpiryReason,
    },
}

impl Transition {
    pub fn incident(&self) -> &Incident {
        match self {
            Transition::Opened(i)
            | Transition::Cancelled(i)
            | Transition::Confirmed(i)
            | Transition::Dispatched(i)
            | Transition::Escalate(i)
            | Transition::Acknowledged(i) => i,
            Transition::Expired { incident, .. } => incident,
        }
    }
}

/// A status write that lost the race: the incident was not in the expected
/// status (or is no longer the open one).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stale transition for {id}: expected {expected:?}, found {found:?}")]
pub struct StaleTransition {
    pub id: IncidentId,
    pub expected: IncidentStatus,
    pub found: Option<IncidentStatus>,
}

pub struct IncidentStateMachine {
    config: IncidentConfig,
    phase: DetectionPhase,
    current: Option<Incident>,
    next_id: u64,

    // Debounce / confirmation tracking
    consecutive: u32,
    accumulated: f32,
    confirming_since: Option<Micros>,

    // Dispatch tracking
    ack_deadline: Option<Micros>,
    cooldown_until: Option<Micros>,

    location: Option<GeoPoint>,
    last_seen: Micros,
}

impl IncidentStateMachine {
    pub fn new(config: IncidentConfig) -> Self {
        Self {
            config,
            phase: DetectionPhase::Idle,
            current: None,
            next_id: 1,
            consecutive: 0,
            accumulated: 0.0,
            confirming_since: None,
            ack_deadline: None,
            cooldown_until: None,
            location: None,
            last_seen: 0,
        }
    }

    pub fn phase(&self) -> DetectionPhase {
        self.phase
    }

    pub fn current(&self) -> Option<&Incident> {
        self.current.as_ref()
    }

    /// Latest known position, stamped on incidents when they open and confirm.
    pub fn set_location(&mut self, location: Option<GeoPoint>) {
        self.location = location;
    }

    /// Feed one per-frame classification, in frame order.
    pub fn on_classification(&mut self, c: &Classification) -> Vec<Transition> {
        let now = self.observe(c.captured_at);
        let mut out = self.expire_windows(now);

        match self.phase {
            DetectionPhase::Idle => {
                if !c.label.is_alerting() {
                    return out;
                }
                if let Some(until) = self.cooldown_until {
                    if now < until {
                        debug!("Seq {} ignored: cooldown active", c.sequence);
                        return out;
                    }
                    self.cooldown_until = None;
                }

                let mut incident = Incident::open(IncidentId(self.next_id), c);
                incident.location = self.location;
                self.next_id += 1;
                info!(
                    "{} opened at seq {} (score {:.2}, {})",
                    incident.id,
                    c.sequence,
                    c.score,
                    c.label.as_str()
                );

                self.phase = DetectionPhase::Watching;
                self.consecutive = 1;
                self.accumulated = c.score;
                out.push(Transition::Opened(incident.clone()));
                self.current = Some(incident);

                if self.consecutive >= self.config.debounce_count {
                    self.enter_confirming(now);
                    out.extend(self.evaluate_confirmation(c, now));
                }
            }

            DetectionPhase::Watching => {
                if c.label.is_alerting() {
                    self.consecutive += 1;
                    self.track_score(c.score);
                    if self.consecutive >= self.config.debounce_count {
                        self.enter_confirming(now);
                        out.extend(self.evaluate_confirmation(c, now));
                    }
                } else {
                    // Streak broken; the incident stays open until its window ends.
                    self.consecutive = 0;
                }
            }

            DetectionPhase::Confirming => {
                self.track_score(c.score);
                out.extend(self.evaluate_confirmation(c, now));
            }

            // Past the point of no return; frames no longer change the incident.
            DetectionPhase::Confirmed | DetectionPhase::Dispatched => {}
        }

        out
    }

    /// Time-driven checks: debounce/confirm windows and acknowledgment timeout.
    pub fn tick(&mut self, now: Micros) -> Vec<Transition> {
        let now = self.observe(now);
        let mut out = self.expire_windows(now);

        if matches!(
            self.phase,
            DetectionPhase::Confirmed | DetectionPhase::Dispatched
        ) {
            let deadline_passed = self.ack_deadline.map_or(false, |d| now >= d);
            if deadline_passed {
                let cap = self.config.escalation_cap;
                let ack_timeout = ms_to_micros(self.config.ack_timeout_ms);
                if let Some(incident) = self.current.as_mut() {
                    if incident.escalations < cap {
                        incident.escalations += 1;
                        warn!(
                            "{} unacknowledged after {}ms, escalating ({}/{})",
                            incident.id, self.config.ack_timeout_ms, incident.escalations, cap
                        );
                        self.ack_deadline = Some(now + ack_timeout);
                        out.push(Transition::Escalate(incident.clone()));
                    } else {
                        out.extend(self.expire(now, ExpiryReason::AckTimeout));
                    }
                }
            }
        }

        out
    }

    /// Compare-and-set status write for the dispatch side. Succeeds only if
    /// the open incident is `id` and currently in `expected`.
    pub fn compare_and_set(
        &mut self,
        id: IncidentId,
        expected: IncidentStatus,
        next: IncidentStatus,
        at: Micros,
    ) -> Result<Transition, StaleTransition> {
        let at = self.observe(at);
        let stale = |found| StaleTransition {
            id,
            expected,
            found,
        };

        let found = match self.current.as_ref() {
            Some(i) if i.id == id => i.status,
            _ => return Err(stale(None)),
        };
        if found != expected || !expected.can_advance_to(next) {
            return Err(stale(Some(found)));
        }

        match next {
            IncidentStatus::Dispatched => {
                let incident = self.current.as_mut().ok_or_else(|| stale(None))?;
                incident.advance(next, at);
                self.phase = DetectionPhase::Dispatched;
                info!("{} dispatched", incident.id);
                Ok(Transition::Dispatched(incident.clone()))
            }
            IncidentStatus::Acknowledged => {
                let incident = self
                    .close(IncidentStatus::Acknowledged, at)
                    .ok_or_else(|| stale(None))?;
                info!(
                    "{} acknowledged by {}",
                    incident.id,
                    incident.acknowledged_by.as_deref().unwrap_or("?")
                );
                Ok(Transition::Acknowledged(incident))
            }
            IncidentStatus::Expired => {
                let incident = self
                    .close(IncidentStatus::Expired, at)
                    .ok_or_else(|| stale(None))?;
                warn!("{} expired: dispatch attempts exhausted", incident.id);
                Ok(Transition::Expired {
                    incident,
                    reason: ExpiryReason::DispatchExhausted,
                })
            }
            _ => Err(stale(Some(found))),
        }
    }

    /// First attempt left the notifier.
    pub fn on_attempt_sent(&mut self, id: IncidentId, at: Micros) -> Option<Transition> {
        match self.compare_and_set(id, IncidentStatus::Confirmed, IncidentStatus::Dispatched, at) {
            Ok(t) => Some(t),
            Err(e) => {
                // Later attempts find the incident already dispatched.
                debug!("{}", e);
                None
            }
        }
    }

    pub fn on_acknowledged(
        &mut self,
        id: IncidentId,
        endpoint: EndpointId,
        at: Micros,
    ) -> Option<Transition> {
        if let Some(incident) = self.current.as_mut().filter(|i| i.id == id) {
            if incident.status == IncidentStatus::Dispatched {
                incident.acknowledged_by = Some(endpoint);
            }
        }
        match self.compare_and_set(
            id,
            IncidentStatus::Dispatched,
            IncidentStatus::Acknowledged,
            at,
        ) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!("Acknowledgment ignored: {}", e);
                None
            }
        }
    }

    pub fn on_dispatch_exhausted(&mut self, id: IncidentId, at: Micros) -> Option<Transition> {
        let expected = match self.current.as_ref() {
            Some(i) if i.id == id => i.status,
            _ => IncidentStatus::Dispatched,
        };
        match self.compare_and_set(id, expected, IncidentStatus::Expired, at) {
            Ok(t) => Some(t),
            Err(e) => {
                debug!("Exhaustion ignored: {}", e);
                None
            }
        }
    }

    /// Session shutdown: an incident that has not been confirmed is
    /// cancelled; a confirmed or dispatched one is left alone.
    pub fn cancel_unconfirmed(&mut self, now: Micros) -> Option<Transition> {
        let now = self.observe(now);
        match self.phase {
            DetectionPhase::Watching | DetectionPhase::Confirming => {
                let incident = self.close(IncidentStatus::Cancelled, now)?;
                info!("{} cancelled at shutdown", incident.id);
                Some(Transition::Cancelled(incident))
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------------

    /// Timestamps are clamped so a late tick never moves time backwards.
    fn observe(&mut self, at: Micros) -> Micros {
        self.last_seen = self.last_seen.max(at);
        self.last_seen
    }

    fn track_score(&mut self, score: f32) {
        self.accumulated += score;
        if let Some(incident) = self.current.as_mut() {
            incident.severity = incident.severity.max(score);
        }
    }

    fn enter_confirming(&mut self, now: Micros) {
        self.phase = DetectionPhase::Confirming;
        self.confirming_since = Some(now);
        debug!(
            "Debounce satisfied ({} consecutive), confirming",
            self.consecutive
        );
    }

    fn evaluate_confirmation(&mut self, c: &Classification, now: Micros) -> Option<Transition> {
        let explicit_impact = c.label == Label::Impact;
        if !explicit_impact && self.accumulated < self.config.confirm_severity {
            return None;
        }

        let location = self.location;
        let incident = self.current.as_mut()?;
        incident.confirming_sequence = Some(c.sequence);
        if location.is_some() {
            incident.location = location;
        }
        incident.advance(IncidentStatus::Confirmed, now);

        self.phase = DetectionPhase::Confirmed;
        self.ack_deadline = Some(now + ms_to_micros(self.config.ack_timeout_ms));
        info!(
            "{} CONFIRMED at seq {} (severity {:.2}, {})",
            incident.id,
            c.sequence,
            incident.severity,
            if explicit_impact {
                "impact label"
            } else {
                "accumulated severity"
            }
        );
        Some(Transition::Confirmed(incident.clone()))
    }

    fn expire_windows(&mut self, now: Micros) -> Vec<Transition> {
        let mut out = Vec::new();
        match self.phase {
            DetectionPhase::Watching => {
                let opened_at = self.current.as_ref().map_or(now, |i| i.opened_at);
                if now.saturating_sub(opened_at) > ms_to_micros(self.config.debounce_window_ms) {
                    if let Some(incident) = self.close(IncidentStatus::Cancelled, now) {
                        info!(
                            "{} cancelled: debounce window elapsed (false alarm)",
                            incident.id
                        );
                        out.push(Transition::Cancelled(incident));
                    }
                }
            }
            DetectionPhase::Confirming => {
                let since = self.confirming_since.unwrap_or(now);
                if now.saturating_sub(since) > ms_to_micros(self.config.confirm_window_ms) {
                    if let Some(incident) = self.close(IncidentStatus::Cancelled, now) {
                        info!("{} cancelled: never confirmed", incident.id);
                        out.push(Transition::Cancelled(incident));
                    }
                }
            }
            _ => {}
        }
        out
    }

    fn expire(&mut self, now: Micros, reason: ExpiryReason) -> Option<Transition> {
        let status = self.current.as_ref()?.status;
        if !status.can_advance_to(IncidentStatus::Expired) {
            return None;
        }
        let incident = self.close(IncidentStatus::Expired, now)?;
        warn!("{} expired ({:?})", incident.id, reason);
        Some(Transition::Expired { incident, reason })
    }

    /// Moves the open incident to a terminal status and returns to Idle.
    fn close(&mut self, status: IncidentStatus, at: Micros) -> Option<Incident> {
        let mut incident = self.current.take()?;
        incident.advance(status, at);

        if matches!(
            status,
            IncidentStatus::Acknowledged | IncidentStatus::Expired
        ) {
            self.cooldown_until = Some(at + ms_to_micros(self.config.cooldown_ms));
        }

        self.phase = DetectionPhase::Idle;
        self.consecutive = 0;
        self.accumulated = 0.0;
        self.confirming_since = None;
        self.ack_deadline = None;
        Some(incident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Micros = 1_000;

    fn config() -> IncidentConfig {
        IncidentConfig {
            debounce_count: 3,
            debounce_window_ms: 2_000,
            confirm_window_ms: 3_000,
            confirm_severity: 2.0,
            ack_timeout_ms: 60_000,
            escalation_cap: 2,
            cooldown_ms: 0,
        }
    }

    fn cls(sequence: u64, at_ms: u64, score: f32) -> Classification {
        Classification::new(sequence, at_ms * MS, score, 0.3, 0.7)
    }

    fn feed(sm: &mut IncidentStateMachine, scores: &[f32], start_ms: u64, step_ms: u64) -> Vec<Transition> {
        scores
            .iter()
            .enumerate()
            .flat_map(|(i, &s)| sm.on_classification(&cls(i as u64 + 1, start_ms + i as u64 * step_ms, s)))
            .collect()
    }

    fn confirmed(transitions: &[Transition]) -> Option<&Incident> {
        transitions.iter().find_map(|t| match t {
            Transition::Confirmed(i) => Some(i),
            _ => None,
        })
    }

    #[test]
    fn three_impacts_ten_ms_apart_confirm_on_third_frame() {
        let mut sm = IncidentStateMachine::new(config());
        let out = feed(&mut sm, &[0.8, 0.8, 0.8], 0, 10);

        let incident = confirmed(&out).expect("incident should confirm");
        assert_eq!(incident.opening_sequence, 1);
        assert_eq!(incident.confirming_sequence, Some(3));
        assert_eq!(incident.status, IncidentStatus::Confirmed);
        assert!((incident.severity - 0.8).abs() < 1e-6);
        assert_eq!(sm.phase(), DetectionPhase::Confirmed);
    }

    #[test]
    fn broken_streak_never_confirms() {
        let mut sm = IncidentStateMachine::new(config());
        let out = feed(&mut sm, &[0.8, 0.1, 0.8], 0, 10);
        assert!(confirmed(&out).is_none());
        assert_eq!(sm.phase(), DetectionPhase::Watching);

        // Window runs out without a full streak: false alarm.
        let out = sm.tick(2_100 * MS);
        assert!(matches!(out.as_slice(), [Transition::Cancelled(i)] if i.status == IncidentStatus::Cancelled));
        assert_eq!(sm.phase(), DetectionPhase::Idle);
    }

    #[test]
    fn single_suspicious_then_normals_is_debounced() {
        let mut sm = IncidentStateMachine::new(config());
        let out = feed(&mut sm, &[0.5, 0.1, 0.1], 0, 33);
        assert!(matches!(out.as_slice(), [Transition::Opened(_)]));
        assert!(confirmed(&out).is_none());
    }

    #[test]
    fn suspicious_streak_confirms_by_accumulated_severity() {
        let mut sm = IncidentStateMachine::new(config());
        // Three suspicious frames reach Confirming with 1.5 accumulated;
        // the fourth pushes it past 2.0.
        let out = feed(&mut sm, &[0.5, 0.5, 0.5], 0, 33);
        assert!(confirmed(&out).is_none());
        assert_eq!(sm.phase(), DetectionPhase::Confirming);

        let out = sm.on_classification(&cls(4, 132, 0.6));
        let incident = confirmed(&out).expect("severity should confirm");
        assert_eq!(incident.confirming_sequence, Some(4));
    }

    #[test]
    fn confirming_times_out_to_cancelled() {
        let mut sm = IncidentStateMachine::new(config());
        feed(&mut sm, &[0.4, 0.4, 0.4], 0, 10);
        assert_eq!(sm.phase(), DetectionPhase::Confirming);
        let out = sm.tick(3_100 * MS);
        assert!(matches!(out.as_slice(), [Transition::Cancelled(_)]));
    }

    #[test]
    fn incident_ids_strictly_increase_and_only_one_is_open() {
        let mut sm = IncidentStateMachine::new(config());
        let mut ids = Vec::new();
        let mut t = 0;
        for _ in 0..4 {
            for s in [0.5, 0.1] {
                for tr in sm.on_classification(&cls(t, t, s)) {
                    if let Transition::Opened(i) = tr {
                        ids.push(i.id);
                    }
                }
                t += 1;
            }
            for tr in sm.tick((t + 2_500) * MS) {
                assert!(matches!(tr, Transition::Cancelled(_)));
            }
            t += 2_600;
            assert!(sm.current().is_none());
        }
        assert_eq!(ids, vec![IncidentId(1), IncidentId(2), IncidentId(3), IncidentId(4)]);
    }

    #[test]
    fn dispatched_incident_is_acknowledged() {
        let mut sm = IncidentStateMachine::new(config());
        feed(&mut sm, &[0.9, 0.9, 0.9], 0, 10);
        let id = sm.current().unwrap().id;

        assert!(matches!(sm.on_attempt_sent(id, 30 * MS), Some(Transition::Dispatched(_))));
        // Second attempt report is a no-op.
        assert!(sm.on_attempt_sent(id, 40 * MS).is_none());

        match sm.on_acknowledged(id, "Unit-01".to_string(), 50 * MS) {
            Some(Transition::Acknowledged(i)) => {
                assert_eq!(i.status, IncidentStatus::Acknowledged);
                assert_eq!(i.acknowledged_by.as_deref(), Some("Unit-01"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sm.phase(), DetectionPhase::Idle);
    }

    #[test]
    fn missing_ack_escalates_then_expires() {
        let mut sm = IncidentStateMachine::new(config());
        feed(&mut sm, &[0.9, 0.9, 0.9], 0, 10);
        let id = sm.current().unwrap().id;
        sm.on_attempt_sent(id, 20 * MS);

        assert!(sm.tick(59_000 * MS).is_empty());
        assert!(matches!(sm.tick(60_100 * MS).as_slice(), [Transition::Escalate(i)] if i.escalations == 1));
        assert!(sm.tick(61_000 * MS).is_empty());
        assert!(matches!(sm.tick(120_100 * MS).as_slice(), [Transition::Escalate(i)] if i.escalations == 2));

        let out = sm.tick(180_100 * MS);
        match out.as_slice() {
            [Transition::Expired { incident, reason }] => {
                assert_eq!(*reason, ExpiryReason::AckTimeout);
                assert_eq!(incident.status, IncidentStatus::Expired);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn confirmed_without_any_send_does_not_hang() {
        let mut sm = IncidentStateMachine::new(config());
        feed(&mut sm, &[0.9, 0.9, 0.9], 0, 10);
        let mut t = 0;
        let mut expired = false;
        for _ in 0..10 {
            t += 61_000;
            if sm
                .tick(t * MS)
                .iter()
                .any(|tr| matches!(tr, Transition::Expired { .. }))
            {
                expired = true;
                break;
            }
        }
        assert!(expired);
    }

    #[test]
    fn exhaustion_expires_and_stale_writes_are_rejected() {
        let mut sm = IncidentStateMachine::new(config());
        feed(&mut sm, &[0.9, 0.9, 0.9], 0, 10);
        let id = sm.current().unwrap().id;
        sm.on_attempt_sent(id, 20 * MS);

        assert!(matches!(
            sm.on_dispatch_exhausted(id, 30 * MS),
            Some(Transition::Expired { reason: ExpiryReason::DispatchExhausted, .. })
        ));
        // A late ack for the expired incident loses the race.
        assert!(sm.on_acknowledged(id, "Unit-02".to_string(), 40 * MS).is_none());
        assert_eq!(
            sm.compare_and_set(id, IncidentStatus::Dispatched, IncidentStatus::Acknowledged, 50 * MS),
            Err(StaleTransition {
                id,
                expected: IncidentStatus::Dispatched,
                found: None
            })
        );
    }

    #[test]
    fn shutdown_cancels_watching_but_not_dispatched() {
        let mut sm = IncidentStateMachine::new(config());
        feed(&mut sm, &[0.5], 0, 10);
        match sm.cancel_unconfirmed(100 * MS) {
            Some(Transition::Cancelled(i)) => assert_eq!(i.status, IncidentStatus::Cancelled),
            other => panic!("unexpected {:?}", other),
        }

        let mut sm = IncidentStateMachine::new(config());
        feed(&mut sm, &[0.9, 0.9, 0.9], 0, 10);
        let id = sm.current().unwrap().id;
        sm.on_attempt_sent(id, 20 * MS);
        assert!(sm.cancel_unconfirmed(100 * MS).is_none());
        assert_eq!(sm.current().unwrap().status, IncidentStatus::Dispatched);
    }

    #[test]
    fn cooldown_suppresses_new_incident_after_ack() {
        let mut cfg = config();
        cfg.cooldown_ms = 5_000;
        let mut sm = IncidentStateMachine::new(cfg);
        feed(&mut sm, &[0.9, 0.9, 0.9], 0, 10);
        let id = sm.current().unwrap().id;
        sm.on_attempt_sent(id, 30 * MS);
        sm.on_acknowledged(id, "Unit-01".to_string(), 40 * MS);

        assert!(sm.on_classification(&cls(10, 1_000, 0.9)).is_empty());
        assert!(matches!(
            sm.on_classification(&cls(11, 5_100, 0.9)).as_slice(),
            [Transition::Opened(i)] if i.id == IncidentId(2)
        ));
    }

    #[test]
    fn location_is_stamped_on_incident() {
        let mut sm = IncidentStateMachine::new(config());
        sm.set_location(Some(GeoPoint::new(10.5, 76.2)));
        let out = feed(&mut sm, &[0.9, 0.9, 0.9], 0, 10);
        assert_eq!(
            confirmed(&out).unwrap().location,
            Some(GeoPoint::new(10.5, 76.2))
        );
    }
}
