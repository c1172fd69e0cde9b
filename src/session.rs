// src/session.rs
//
// Session coordination and the public facade.
//
// `CrashGuard` is bound to a tokio runtime handle and owns every running
// session. A session is a capture thread, a detection worker thread and the
// dispatch tasks spawned on the runtime. The coordinator keeps the only
// control handles: a stop flag, a command channel and the notifier. Status is
// read from a watch channel the worker publishes into, so `status()` never
// touches pipeline state.

use crate::archive::IncidentArchive;
use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::detection::{DetectionPhase, IncidentStateMachine, WindowedDetector};
use crate::dispatch::{AlertEndpoint, AlertOrigin, DispatchNotifier};
use crate::error::{CrashGuardError, Result};
use crate::frame_source::{CaptureDevice, FrameSource};
use crate::geo::GeoPoint;
use crate::pipeline::event_bus::{EventBus, SessionEvent};
use crate::pipeline::metrics::{MetricsSummary, PipelineMetrics};
use crate::pipeline::worker::{DetectionWorker, WorkerCommand};
use crate::signal::SignalExtractor;
use crate::types::{DispatchAttempt, Incident, IncidentId, SessionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Running,
    /// Frame source lost; dispatch of an open incident continues.
    Degraded,
    /// Stop requested while an incident was confirmed or dispatched.
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub driver_id: String,
    pub vehicle_id: String,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    pub phase: DetectionPhase,
    pub source: String,
    pub location: Option<GeoPoint>,
    pub current_incident: Option<Incident>,
    pub current_attempts: Vec<DispatchAttempt>,
    pub closed_incidents: Vec<Incident>,
    pub metrics: MetricsSummary,
    pub last_error: Option<String>,
}

// ============================================================================
// SESSION COORDINATOR
// ============================================================================

pub struct SessionCoordinator {
    id: SessionId,
    stop: Arc<AtomicBool>,
    commands: Sender<WorkerCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    events: Arc<EventBus>,
    notifier: Arc<DispatchNotifier>,
    worker: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl SessionCoordinator {
    /// Validates the config, opens the device and starts the pipeline.
    /// `extra_endpoints` are appended after the configured HTTP endpoints.
    pub fn start(
        runtime: Handle,
        config: Config,
        device: Box<dyn CaptureDevice>,
        extra_endpoints: Vec<Arc<dyn AlertEndpoint>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let mut endpoints = DispatchNotifier::http_endpoints(&config.dispatch)?;
        endpoints.extend(extra_endpoints);
        if endpoints.is_empty() {
            return Err(CrashGuardError::config(
                "at least one dispatch endpoint is required",
            ));
        }

        let id = SessionId::generate();
        let metrics = PipelineMetrics::new();
        let source = FrameSource::start(device, &config.source, Arc::clone(&clock), metrics.clone())?;

        let (feedback_tx, feedback_rx) = mpsc::channel();
        let notifier = Arc::new(DispatchNotifier::new(
            runtime,
            endpoints,
            &config.dispatch,
            Arc::clone(&clock),
            feedback_tx,
            metrics.clone(),
        ));

        let mut ism = IncidentStateMachine::new(config.incident.clone());
        ism.set_location(config.session.location);

        let origin = AlertOrigin {
            session_id: id.clone(),
            driver_id: config.session.driver_id.clone(),
            vehicle_id: config.session.vehicle_id.clone(),
        };
        let started_at = Utc::now();

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            session_id: id.clone(),
            driver_id: origin.driver_id.clone(),
            vehicle_id: origin.vehicle_id.clone(),
            started_at,
            state: SessionState::Running,
            phase: ism.phase(),
            source: source.description().to_string(),
            location: config.session.location,
            current_incident: None,
            current_attempts: Vec::new(),
            closed_incidents: Vec::new(),
            metrics: metrics.summary(),
            last_error: None,
        });

        let events = Arc::new(EventBus::new(config.session.event_buffer));
        let (command_tx, command_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let join_timeout = Duration::from_millis(config.session.join_timeout_ms);
        let archive = config
            .session
            .archive_path
            .as_deref()
            .map(IncidentArchive::new);

        info!(
            "🚗 Session {} starting: driver {}, vehicle {}, {} endpoint(s), source {}",
            id,
            origin.driver_id,
            origin.vehicle_id,
            notifier.endpoint_count(),
            source.description()
        );

        let worker = DetectionWorker {
            origin,
            started_at,
            extractor: SignalExtractor::new(config.extraction.clone()),
            detector: Box::new(WindowedDetector::new(config.detection.clone())),
            ism,
            notifier: Arc::clone(&notifier),
            feedback: feedback_rx,
            commands: command_rx,
            stop: Arc::clone(&stop),
            clock,
            events: Arc::clone(&events),
            snapshots: snapshot_tx,
            metrics,
            archive,
            source,
            config,
        };

        let handle = thread::Builder::new()
            .name("crashguard-detect".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            id,
            stop,
            commands: command_tx,
            snapshots: snapshot_rx,
            events,
            notifier,
            worker: Mutex::new(Some(handle)),
            join_timeout,
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn status(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn recent_events(&self) -> Vec<SessionEvent> {
        self.events.recent()
    }

    pub fn acknowledge(&self, incident: IncidentId, endpoint: &str) -> bool {
        self.notifier.acknowledge(incident, endpoint)
    }

    pub fn decline(&self, incident: IncidentId, endpoint: &str) -> bool {
        self.notifier.decline(incident, endpoint)
    }

    pub fn update_location(&self, point: GeoPoint) -> Result<()> {
        if !point.is_valid() {
            return Err(CrashGuardError::config(format!(
                "invalid location {}, {}",
                point.latitude, point.longitude
            )));
        }
        // A stopped worker has dropped its receiver; nothing left to update.
        let _ = self.commands.send(WorkerCommand::UpdateLocation(point));
        Ok(())
    }

    /// Raises the stop flag and waits up to `join_timeout` for the worker.
    /// A worker still draining an in-flight incident keeps running; its
    /// state shows as `Draining` until the incident closes.
    pub fn stop(&self) -> SessionSnapshot {
        self.stop.store(true, Ordering::Release);

        let deadline = Instant::now() + self.join_timeout;
        while !self.worker_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
        match worker.take() {
            Some(handle) if handle.is_finished() => {
                if handle.join().is_err() {
                    warn!("Detection worker for {} panicked", self.id);
                }
            }
            Some(handle) => {
                info!(
                    "Session {} still draining after {:?}, worker left running",
                    self.id, self.join_timeout
                );
                *worker = Some(handle);
            }
            None => {}
        }
        drop(worker);
        self.status()
    }

    /// Stop was requested and the detection worker has exited.
    pub fn is_finished(&self) -> bool {
        self.stop.load(Ordering::Acquire) && self.worker_finished()
    }

    fn worker_finished(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(true, |h| h.is_finished())
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

// ============================================================================
// FACADE
// ============================================================================

/// One per process. Sessions run their threads independently; dispatch tasks
/// run on the runtime behind `runtime`.
pub struct CrashGuard {
    runtime: Handle,
    clock: Arc<dyn Clock>,
    endpoints: Vec<Arc<dyn AlertEndpoint>>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionCoordinator>>>,
}

impl CrashGuard {
    pub fn new(runtime: Handle) -> Self {
        Self::with_clock(runtime, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(runtime: Handle, clock: Arc<dyn Clock>) -> Self {
        Self {
            runtime,
            clock,
            endpoints: Vec::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Adds an endpoint to every session started afterwards, after the
    /// configured HTTP endpoints.
    pub fn with_endpoint(mut self, endpoint: Arc<dyn AlertEndpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn start_session(&self, config: Config, device: Box<dyn CaptureDevice>) -> Result<SessionId> {
        let session = SessionCoordinator::start(
            self.runtime.clone(),
            config,
            device,
            self.endpoints.clone(),
            Arc::clone(&self.clock),
        )?;
        let id = session.id().clone();
        self.lock().insert(id.clone(), Arc::new(session));
        Ok(id)
    }

    pub fn status(&self, id: &SessionId) -> Result<SessionSnapshot> {
        self.with_session(id, |s| s.status())
    }

    /// Stops the session and releases it. A session still draining an
    /// incident stays reachable until its worker exits.
    pub fn stop_session(&self, id: &SessionId) -> Result<SessionSnapshot> {
        let snapshot = self.session(id)?.stop();
        if snapshot.state == SessionState::Stopped {
            self.lock().remove(id);
        }
        Ok(snapshot)
    }

    pub fn subscribe(&self, id: &SessionId) -> Result<broadcast::Receiver<SessionEvent>> {
        self.with_session(id, |s| s.subscribe())
    }

    pub fn watch(&self, id: &SessionId) -> Result<watch::Receiver<SessionSnapshot>> {
        self.with_session(id, |s| s.watch())
    }

    pub fn recent_events(&self, id: &SessionId) -> Result<Vec<SessionEvent>> {
        self.with_session(id, |s| s.recent_events())
    }

    /// Returns false if no dispatch is running for the incident.
    pub fn acknowledge(&self, id: &SessionId, incident: IncidentId, endpoint: &str) -> Result<bool> {
        self.with_session(id, |s| s.acknowledge(incident, endpoint))
    }

    pub fn decline(&self, id: &SessionId, incident: IncidentId, endpoint: &str) -> Result<bool> {
        self.with_session(id, |s| s.decline(incident, endpoint))
    }

    pub fn update_location(&self, id: &SessionId, point: GeoPoint) -> Result<()> {
        self.with_session(id, |s| s.update_location(point))?
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.lock().keys().cloned().collect()
    }

    fn with_session<T>(&self, id: &SessionId, f: impl FnOnce(&SessionCoordinator) -> T) -> Result<T> {
        let session = self.session(id)?;
        Ok(f(&session))
    }

    fn session(&self, id: &SessionId) -> Result<Arc<SessionCoordinator>> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CrashGuardError::UnknownSession(id.to_string()))
    }

    /// Locks the session table, dropping sessions whose drain has finished.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, Arc<SessionCoordinator>>> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|id, s| {
            let finished = s.is_finished();
            if finished {
                debug!("Session {} released", id);
            }
            !finished
        });
        sessions
    }
}
