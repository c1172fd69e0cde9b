// src/pipeline/worker.rs
//
// Detection worker: one thread per session.
//
//   loop:
//     apply coordinator commands (location updates)
//     drain dispatch feedback → state machine (compare-and-set)
//     poll one frame (bounded by tick_interval)
//       → SignalExtractor → Detector → IncidentStateMachine
//     tick the state machine (windows, ack timeout)
//     publish snapshot
//
// Frames are processed strictly in sequence order. On stop the capture side
// is shut down first; an unconfirmed incident is cancelled, a confirmed or
// dispatched one is drained: the loop keeps handling feedback and ticks,
// without frames, until the incident is terminal.

use crate::archive::{ArchiveRecord, IncidentArchive};
use crate::clock::Clock;
use crate::config::Config;
use crate::detection::{Detector, IncidentStateMachine, Transition};
use crate::dispatch::{AlertOrigin, DispatchAlert, DispatchFeedback, DispatchNotifier};
use crate::frame_source::{FrameSource, SourcePoll};
use crate::geo::GeoPoint;
use crate::pipeline::event_bus::{EventBus, SessionEvent};
use crate::pipeline::metrics::PipelineMetrics;
use crate::session::{SessionSnapshot, SessionState};
use crate::signal::SignalExtractor;
use crate::snapshot::Snapshot;
use crate::types::{Frame, Incident};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Closed incidents kept in the snapshot.
const MAX_CLOSED_INCIDENTS: usize = 100;

#[derive(Debug, Clone)]
pub enum WorkerCommand {
    UpdateLocation(GeoPoint),
}

pub struct DetectionWorker {
    pub origin: AlertOrigin,
    pub started_at: DateTime<Utc>,
    pub config: Config,
    pub source: FrameSource,
    pub extractor: SignalExtractor,
    pub detector: Box<dyn Detector>,
    pub ism: IncidentStateMachine,
    pub notifier: Arc<DispatchNotifier>,
    pub feedback: Receiver<DispatchFeedback>,
    pub commands: Receiver<WorkerCommand>,
    pub stop: Arc<AtomicBool>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<EventBus>,
    pub snapshots: watch::Sender<SessionSnapshot>,
    pub metrics: PipelineMetrics,
    pub archive: Option<IncidentArchive>,
}

struct LoopState {
    state: SessionState,
    previous: Option<Frame>,
    location: Option<GeoPoint>,
    closed: VecDeque<Incident>,
    last_error: Option<String>,
}

impl DetectionWorker {
    pub fn run(mut self) {
        let tick = Duration::from_millis(self.config.session.tick_interval_ms.max(1));
        let join_timeout = Duration::from_millis(self.config.session.join_timeout_ms);
        let mut st = LoopState {
            state: SessionState::Running,
            previous: None,
            location: self.config.session.location,
            closed: VecDeque::new(),
            last_error: None,
        };

        info!(
            "Detection worker started for session {} ({})",
            self.origin.session_id,
            self.source.description()
        );

        loop {
            self.apply_commands(&mut st);
            self.drain_feedback(&mut st);

            if st.state == SessionState::Draining {
                if self.ism.current().is_none() {
                    info!("In-flight incident closed, draining complete");
                    break;
                }
                thread::sleep(tick);
            } else if self.stop.load(Ordering::Acquire) {
                self.source.shutdown(join_timeout);
                let now = self.clock.now_micros();
                if let Some(t) = self.ism.cancel_unconfirmed(now) {
                    self.apply(t, None, &mut st);
                }
                if self.ism.current().is_none() {
                    break;
                }
                warn!(
                    "Stop requested with {} in flight, draining",
                    self.ism
                        .current()
                        .map(|i| i.id.to_string())
                        .unwrap_or_default()
                );
                st.state = SessionState::Draining;
            } else if self.source.is_closed() {
                thread::sleep(tick);
            } else {
                match self.source.poll(tick) {
                    SourcePoll::Frame(frame) => {
                        self.process_frame(&frame, &mut st);
                        st.previous = Some(frame);
                    }
                    SourcePoll::Idle => {}
                    SourcePoll::Lost(e) => {
                        error!("⚠️ Frame source lost, detection paused: {}", e);
                        st.state = SessionState::Degraded;
                        st.last_error = Some(e.to_string());
                        st.previous = None;
                        self.detector.reset();
                        self.events.publish(SessionEvent::SourceDegraded {
                            reason: e.to_string(),
                        });
                    }
                    SourcePoll::Ended => {
                        info!("Frame source ended, session stays up for dispatch");
                    }
                }
            }

            let now = self.clock.now_micros();
            for t in self.ism.tick(now) {
                self.apply(t, None, &mut st);
            }
            self.publish_snapshot(&st);
        }

        // Join the capture thread if stop raced with the source ending.
        self.source.shutdown(join_timeout);
        st.state = SessionState::Stopped;
        self.publish_snapshot(&st);
        self.events.publish(SessionEvent::SessionStopped {
            session_id: self.origin.session_id.clone(),
        });
        info!("Session {} stopped", self.origin.session_id);
    }

    fn process_frame(&mut self, frame: &Frame, st: &mut LoopState) {
        let started = Instant::now();

        let features = self.extractor.extract(frame, st.previous.as_ref());
        self.metrics
            .set_timing(&self.metrics.extraction_time_us, features.extraction_latency_us);
        if features.low_confidence {
            self.metrics.inc(&self.metrics.low_confidence_frames);
        }

        let classification = self.detector.classify(&features);
        self.metrics.set_timing(
            &self.metrics.detection_time_us,
            started.elapsed().as_micros() as u64,
        );
        self.metrics.inc(&self.metrics.frames_processed);

        if classification.label.is_alerting() {
            debug!(
                "Frame {}: score {:.2} ({}), motion {:.3}, impact {:?}",
                frame.sequence,
                classification.score,
                classification.label.as_str(),
                features.motion_magnitude,
                features.impact_magnitude
            );
        }

        for t in self.ism.on_classification(&classification) {
            self.apply(t, Some(frame), st);
        }
    }

    fn apply(&mut self, transition: Transition, frame: Option<&Frame>, st: &mut LoopState) {
        self.events.publish(SessionEvent::from(&transition));

        match transition {
            Transition::Opened(_) => self.metrics.inc(&self.metrics.incidents_opened),
            Transition::Confirmed(incident) => {
                self.metrics.inc(&self.metrics.incidents_confirmed);
                self.start_dispatch(&incident, frame, st);
            }
            Transition::Dispatched(_) => {}
            Transition::Escalate(incident) => {
                if !self.notifier.escalate(incident.id) {
                    debug!("{} escalation with no active dispatch task", incident.id);
                }
            }
            Transition::Cancelled(incident) => {
                self.metrics.inc(&self.metrics.incidents_cancelled);
                self.close(incident, st);
            }
            Transition::Acknowledged(incident) => {
                self.metrics.inc(&self.metrics.incidents_acknowledged);
                self.close(incident, st);
            }
            Transition::Expired { incident, reason } => {
                warn!("{} expired ({:?})", incident.id, reason);
                self.metrics.inc(&self.metrics.incidents_expired);
                self.notifier.cancel(incident.id);
                self.close(incident, st);
            }
        }
    }

    fn start_dispatch(&mut self, incident: &Incident, frame: Option<&Frame>, st: &mut LoopState) {
        let dispatch = &self.config.dispatch;

        let snapshot = match frame {
            Some(f) if dispatch.attach_snapshot => {
                Snapshot::capture(incident.id, f.sequence, &f.image, dispatch.snapshot_quality)
            }
            _ => None,
        };
        if let (Some(snap), Some(dir)) = (&snapshot, &self.config.session.snapshot_dir) {
            match snap.write_to(Path::new(dir)) {
                Ok(path) => info!("📸 Crash snapshot saved to {}", path.display()),
                Err(e) => warn!("Failed to save crash snapshot: {}", e),
            }
        }

        let alert =
            DispatchAlert::for_incident(&self.origin, incident, &dispatch.landmarks, snapshot.as_ref());

        if let Err(e) = self.notifier.dispatch(alert) {
            error!("Dispatch for {} could not start: {}", incident.id, e);
            let now = self.clock.now_micros();
            if let Some(t) = self.ism.on_dispatch_exhausted(incident.id, now) {
                self.apply(t, None, st);
            }
        }
    }

    fn close(&mut self, incident: Incident, st: &mut LoopState) {
        if let Some(archive) = &self.archive {
            let attempts = self.notifier.attempts(incident.id);
            let record = ArchiveRecord {
                session_id: &self.origin.session_id,
                driver_id: &self.origin.driver_id,
                vehicle_id: &self.origin.vehicle_id,
                archived_at: Utc::now(),
                incident: &incident,
                attempts: &attempts,
            };
            if let Err(e) = archive.append(&record) {
                error!("Failed to archive {}: {}", incident.id, e);
                st.last_error = Some(e.to_string());
            }
        }

        if st.closed.len() >= MAX_CLOSED_INCIDENTS {
            st.closed.pop_front();
        }
        st.closed.push_back(incident);
    }

    fn apply_commands(&mut self, st: &mut LoopState) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                WorkerCommand::UpdateLocation(point) => {
                    debug!(
                        "Location updated: {:.5}, {:.5}",
                        point.latitude, point.longitude
                    );
                    st.location = Some(point);
                    self.ism.set_location(Some(point));
                }
            }
        }
    }

    fn drain_feedback(&mut self, st: &mut LoopState) {
        while let Ok(feedback) = self.feedback.try_recv() {
            let transition = match feedback {
                DispatchFeedback::AttemptSent { incident, at, .. } => {
                    self.ism.on_attempt_sent(incident, at)
                }
                DispatchFeedback::AttemptRecorded(attempt) => {
                    self.events
                        .publish(SessionEvent::DispatchAttemptRecorded(attempt));
                    None
                }
                DispatchFeedback::Acknowledged {
                    incident,
                    endpoint,
                    at,
                } => self.ism.on_acknowledged(incident, endpoint, at),
                DispatchFeedback::Exhausted { incident, at, .. } => {
                    self.ism.on_dispatch_exhausted(incident, at)
                }
            };
            if let Some(t) = transition {
                self.apply(t, None, st);
            }
        }
    }

    fn publish_snapshot(&self, st: &LoopState) {
        let current = self.ism.current().cloned();
        let current_attempts = current
            .as_ref()
            .map(|i| self.notifier.attempts(i.id))
            .unwrap_or_default();

        self.snapshots.send_replace(SessionSnapshot {
            session_id: self.origin.session_id.clone(),
            driver_id: self.origin.driver_id.clone(),
            vehicle_id: self.origin.vehicle_id.clone(),
            started_at: self.started_at,
            state: st.state,
            phase: self.ism.phase(),
            source: self.source.description().to_string(),
            location: st.location,
            current_incident: current,
            current_attempts,
            closed_incidents: st.closed.iter().cloned().collect(),
            metrics: self.metrics.summary(),
            last_error: st.last_error.clone(),
        });
    }
}
