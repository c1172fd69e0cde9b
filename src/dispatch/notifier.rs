// src/dispatch/notifier.rs
//
// Per-incident dispatch task.
//
// `dispatch()` spawns one task per confirmed incident on the session's tokio
// runtime and returns immediately. The task walks the endpoint plan:
//
//   for each endpoint (priority or nearest-first):
//     up to `max_attempts_per_endpoint` attempts:
//       report AttemptSent → deliver (bounded by attempt_timeout)
//         receipt acknowledged       → Acknowledged, done
//         delivered                  → wait: ack → done
//                                            escalate → timed out, next attempt
//                                            decline  → failed, next endpoint
//         error / timeout            → exponential backoff, retry
//   plan exhausted → Exhausted
//
// Control messages (acknowledge, decline, escalate, cancel) reach the task
// through its own channel and are read while a delivery is in flight, while
// waiting for an answer and during backoff. Outcomes flow back to the
// detection worker as `DispatchFeedback`, where the state machine applies
// them compare-and-set.

use super::alert::{DeliveryReceipt, DispatchAlert};
use super::endpoint::{AlertEndpoint, HttpEndpoint};
use crate::clock::{Clock, Micros};
use crate::config::DispatchConfig;
use crate::error::{CrashGuardError, Result};
use crate::geo::GeoPoint;
use crate::pipeline::metrics::PipelineMetrics;
use crate::types::{AttemptOutcome, DispatchAttempt, EndpointId, IncidentId};
use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

// ============================================================================
// POLICY & MESSAGES
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempt_timeout: Duration,
    pub max_attempts_per_endpoint: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms),
            max_attempts_per_endpoint: config.max_attempts_per_endpoint,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay after the k-th failed attempt on an endpoint: base·2^(k−1), capped.
    pub fn backoff(&self, k: u32) -> Duration {
        let shift = k.saturating_sub(1).min(30);
        let base = self.backoff_base.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;
        Duration::from_millis(base.saturating_mul(1u64 << shift).min(max))
    }
}

/// Notifier → detection worker.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchFeedback {
    /// About to deliver. The first one moves the incident to Dispatched.
    AttemptSent {
        incident: IncidentId,
        endpoint: EndpointId,
        attempt: u32,
        at: Micros,
    },
    /// An attempt was opened or its outcome changed.
    AttemptRecorded(DispatchAttempt),
    Acknowledged {
        incident: IncidentId,
        endpoint: EndpointId,
        at: Micros,
    },
    /// Every endpoint used up its attempts without an acknowledgment.
    Exhausted {
        incident: IncidentId,
        attempts: u32,
        at: Micros,
    },
}

#[derive(Debug, Clone)]
enum DispatchControl {
    Acknowledge { endpoint: EndpointId },
    Decline { endpoint: EndpointId },
    Escalate,
    Cancel,
}

type ControlMap = Arc<Mutex<HashMap<IncidentId, UnboundedSender<DispatchControl>>>>;

// ============================================================================
// ATTEMPT LOG
// ============================================================================

/// Every attempt of every incident this session, in attempt order.
#[derive(Clone)]
struct AttemptLog {
    entries: Arc<Mutex<HashMap<IncidentId, Vec<DispatchAttempt>>>>,
    feedback: Sender<DispatchFeedback>,
    metrics: PipelineMetrics,
}

impl AttemptLog {
    fn open(&self, attempt: DispatchAttempt) {
        self.metrics.inc(&self.metrics.dispatch_attempts);
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(attempt.incident_id)
            .or_default()
            .push(attempt.clone());
        self.report(DispatchFeedback::AttemptRecorded(attempt));
    }

    fn resolve(
        &self,
        incident: IncidentId,
        attempt: u32,
        outcome: AttemptOutcome,
        detail: impl Into<String>,
    ) {
        if matches!(outcome, AttemptOutcome::Failed | AttemptOutcome::TimedOut) {
            self.metrics.inc(&self.metrics.dispatch_failures);
        }
        let updated = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .get_mut(&incident)
                .and_then(|list| list.iter_mut().find(|a| a.attempt == attempt))
                .map(|a| {
                    a.outcome = outcome;
                    a.detail = Some(detail.into());
                    a.clone()
                })
        };
        if let Some(a) = updated {
            self.report(DispatchFeedback::AttemptRecorded(a));
        }
    }

    fn get(&self, incident: IncidentId) -> Vec<DispatchAttempt> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&incident)
            .cloned()
            .unwrap_or_default()
    }

    fn report(&self, feedback: DispatchFeedback) {
        // The worker may already be gone at shutdown.
        if self.feedback.send(feedback).is_err() {
            debug!("Dispatch feedback dropped: receiver closed");
        }
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

pub struct DispatchNotifier {
    runtime: Handle,
    endpoints: Vec<Arc<dyn AlertEndpoint>>,
    policy: RetryPolicy,
    order_by_distance: bool,
    clock: Arc<dyn Clock>,
    log: AttemptLog,
    controls: ControlMap,
}

impl DispatchNotifier {
    pub fn new(
        runtime: Handle,
        endpoints: Vec<Arc<dyn AlertEndpoint>>,
        config: &DispatchConfig,
        clock: Arc<dyn Clock>,
        feedback: Sender<DispatchFeedback>,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            runtime,
            endpoints,
            policy: RetryPolicy::from_config(config),
            order_by_distance: config.order_by_distance,
            clock,
            log: AttemptLog {
                entries: Arc::new(Mutex::new(HashMap::new())),
                feedback,
                metrics,
            },
            controls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// HTTP endpoints for every entry in `dispatch.endpoints`.
    pub fn http_endpoints(config: &DispatchConfig) -> Result<Vec<Arc<dyn AlertEndpoint>>> {
        let timeout = Duration::from_millis(config.attempt_timeout_ms);
        config
            .endpoints
            .iter()
            .map(|e| Ok(Arc::new(HttpEndpoint::new(e, timeout)?) as Arc<dyn AlertEndpoint>))
            .collect()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    /// Starts the dispatch task for the alert's incident and returns once it
    /// is running. A second call for the same incident is a no-op.
    pub fn dispatch(&self, alert: DispatchAlert) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(CrashGuardError::dispatch("-", "no endpoints configured"));
        }

        let incident = alert.incident_id;
        let plan = self.plan_for(alert.location.as_ref());
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
            if controls.contains_key(&incident) {
                warn!("{} is already being dispatched", incident);
                return Ok(());
            }
            controls.insert(incident, tx);
        }

        info!(
            "🚨 Dispatching {} (severity {:.2}, {}) → [{}]",
            incident,
            alert.severity,
            alert.address,
            plan.iter().map(|e| e.id()).collect::<Vec<_>>().join(", ")
        );

        let task = IncidentTask {
            alert,
            plan,
            policy: self.policy.clone(),
            clock: Arc::clone(&self.clock),
            log: self.log.clone(),
            controls: rx,
            registry: Arc::clone(&self.controls),
        };
        self.runtime.spawn(task.run());
        Ok(())
    }

    /// Endpoint order for an incident at `location`.
    pub fn dispatch_order(&self, location: Option<&GeoPoint>) -> Vec<EndpointId> {
        self.plan_for(location)
            .iter()
            .map(|e| e.id().to_string())
            .collect()
    }

    fn plan_for(&self, location: Option<&GeoPoint>) -> Vec<Arc<dyn AlertEndpoint>> {
        let origin = match (self.order_by_distance, location) {
            (true, Some(origin)) => origin,
            _ => return self.endpoints.clone(),
        };

        let mut located: Vec<(f64, Arc<dyn AlertEndpoint>)> = Vec::new();
        let mut unlocated: Vec<Arc<dyn AlertEndpoint>> = Vec::new();
        for endpoint in &self.endpoints {
            match endpoint.position() {
                Some(p) => located.push((origin.distance_km(&p), Arc::clone(endpoint))),
                None => unlocated.push(Arc::clone(endpoint)),
            }
        }
        located.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        located
            .into_iter()
            .map(|(_, e)| e)
            .chain(unlocated)
            .collect()
    }

    pub fn acknowledge(&self, incident: IncidentId, endpoint: &str) -> bool {
        self.send(
            incident,
            DispatchControl::Acknowledge {
                endpoint: endpoint.to_string(),
            },
        )
    }

    pub fn decline(&self, incident: IncidentId, endpoint: &str) -> bool {
        self.send(
            incident,
            DispatchControl::Decline {
                endpoint: endpoint.to_string(),
            },
        )
    }

    /// Ack timeout elapsed: give up on the pending attempt and send the next.
    pub fn escalate(&self, incident: IncidentId) -> bool {
        self.send(incident, DispatchControl::Escalate)
    }

    pub fn cancel(&self, incident: IncidentId) -> bool {
        let sent = self.send(incident, DispatchControl::Cancel);
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&incident);
        sent
    }

    pub fn is_active(&self, incident: IncidentId) -> bool {
        self.controls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&incident)
    }

    pub fn attempts(&self, incident: IncidentId) -> Vec<DispatchAttempt> {
        self.log.get(incident)
    }

    fn send(&self, incident: IncidentId, control: DispatchControl) -> bool {
        let controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
        match controls.get(&incident) {
            Some(tx) => tx.send(control).is_ok(),
            None => {
                debug!("No active dispatch for {}, {:?} ignored", incident, control);
                false
            }
        }
    }
}

// ============================================================================
// INCIDENT TASK
// ============================================================================

enum TaskEnd {
    Acknowledged(EndpointId),
    Exhausted(u32),
    Cancelled,
}

/// A control message that changes the course of the plan.
enum Response {
    Acknowledged(EndpointId),
    /// Give up on the current attempt and send the next one now.
    Escalated,
    /// The current endpoint refused; move to the next endpoint.
    Declined,
    Cancelled,
}

/// How an attempt's delivery call ended.
enum Delivery {
    Finished(std::result::Result<Result<DeliveryReceipt>, tokio::time::error::Elapsed>),
    Interrupted(Response),
}

struct IncidentTask {
    alert: DispatchAlert,
    plan: Vec<Arc<dyn AlertEndpoint>>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    log: AttemptLog,
    controls: UnboundedReceiver<DispatchControl>,
    registry: ControlMap,
}

impl IncidentTask {
    async fn run(mut self) {
        let incident = self.alert.incident_id;
        let end = self.deliver_plan().await;

        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&incident);

        let at = self.clock.now_micros();
        match end {
            TaskEnd::Acknowledged(endpoint) => {
                info!("✅ {} acknowledged by {}", incident, endpoint);
                self.log.report(DispatchFeedback::Acknowledged {
                    incident,
                    endpoint,
                    at,
                });
            }
            TaskEnd::Exhausted(attempts) => {
                warn!(
                    "❌ {} not acknowledged after {} attempts, dispatch exhausted",
                    incident, attempts
                );
                self.log.report(DispatchFeedback::Exhausted {
                    incident,
                    attempts,
                    at,
                });
            }
            TaskEnd::Cancelled => debug!("Dispatch task for {} cancelled", incident),
        }
    }

    async fn deliver_plan(&mut self) -> TaskEnd {
        let incident = self.alert.incident_id;
        let plan = self.plan.clone();
        let mut attempt_no: u32 = 0;

        'endpoints: for endpoint in &plan {
            let endpoint_id = endpoint.id().to_string();
            let mut tries: u32 = 0;

            while tries < self.policy.max_attempts_per_endpoint {
                match self.drain_controls(&endpoint_id) {
                    Some(Response::Acknowledged(by)) => return TaskEnd::Acknowledged(by),
                    Some(Response::Cancelled) => return TaskEnd::Cancelled,
                    Some(Response::Declined) => {
                        info!("{} declined {}, reassigning", endpoint_id, incident);
                        continue 'endpoints;
                    }
                    Some(Response::Escalated) | None => {}
                }
                tries += 1;
                attempt_no += 1;
                self.alert.attempt = attempt_no;

                let sent_at = self.clock.now_micros();
                self.log.open(DispatchAttempt {
                    incident_id: incident,
                    endpoint_id: endpoint_id.clone(),
                    attempt: attempt_no,
                    sent_at,
                    outcome: AttemptOutcome::Pending,
                    detail: None,
                });
                self.log.report(DispatchFeedback::AttemptSent {
                    incident,
                    endpoint: endpoint_id.clone(),
                    attempt: attempt_no,
                    at: sent_at,
                });

                let response = match self.deliver_once(&**endpoint, &endpoint_id).await {
                    Delivery::Interrupted(response) => Some(response),
                    Delivery::Finished(Ok(Ok(receipt))) if receipt.acknowledged => {
                        self.log.resolve(
                            incident,
                            attempt_no,
                            AttemptOutcome::Acked,
                            "acknowledged in receipt",
                        );
                        return TaskEnd::Acknowledged(endpoint_id);
                    }
                    Delivery::Finished(Ok(Ok(_))) => {
                        debug!("{} delivered to {}, awaiting acknowledgment", incident, endpoint_id);
                        Some(self.await_response(&endpoint_id).await)
                    }
                    Delivery::Finished(Ok(Err(e))) => {
                        warn!("{} attempt {} failed: {}", incident, attempt_no, e);
                        self.log
                            .resolve(incident, attempt_no, AttemptOutcome::Failed, e.to_string());
                        None
                    }
                    Delivery::Finished(Err(_)) => {
                        warn!(
                            "{} attempt {} to {} timed out after {:?}",
                            incident, attempt_no, endpoint_id, self.policy.attempt_timeout
                        );
                        self.log.resolve(
                            incident,
                            attempt_no,
                            AttemptOutcome::TimedOut,
                            format!("no response within {:?}", self.policy.attempt_timeout),
                        );
                        None
                    }
                };

                match response {
                    Some(Response::Acknowledged(by)) => {
                        self.log.resolve(
                            incident,
                            attempt_no,
                            AttemptOutcome::Acked,
                            format!("acknowledged by {}", by),
                        );
                        return TaskEnd::Acknowledged(by);
                    }
                    Some(Response::Escalated) => {
                        self.log.resolve(
                            incident,
                            attempt_no,
                            AttemptOutcome::TimedOut,
                            "no acknowledgment",
                        );
                        continue;
                    }
                    Some(Response::Declined) => {
                        self.log
                            .resolve(incident, attempt_no, AttemptOutcome::Failed, "declined");
                        info!("{} declined {}, reassigning", endpoint_id, incident);
                        continue 'endpoints;
                    }
                    Some(Response::Cancelled) => return TaskEnd::Cancelled,
                    None => {}
                }

                if tries < self.policy.max_attempts_per_endpoint {
                    match self.backoff(tries, &endpoint_id).await {
                        Some(Response::Acknowledged(by)) => return TaskEnd::Acknowledged(by),
                        Some(Response::Cancelled) => return TaskEnd::Cancelled,
                        Some(Response::Declined) => {
                            info!("{} declined {}, reassigning", endpoint_id, incident);
                            continue 'endpoints;
                        }
                        Some(Response::Escalated) | None => {}
                    }
                }
            }
        }

        // An acknowledgment may still be queued behind the last attempt.
        match self.drain_controls("") {
            Some(Response::Acknowledged(by)) => TaskEnd::Acknowledged(by),
            Some(Response::Cancelled) => TaskEnd::Cancelled,
            _ => TaskEnd::Exhausted(attempt_no),
        }
    }

    /// Runs one delivery bounded by the attempt timeout, while still
    /// listening for the unit's answer and for the state machine.
    async fn deliver_once(&mut self, endpoint: &dyn AlertEndpoint, endpoint_id: &str) -> Delivery {
        let delivery = tokio::time::timeout(self.policy.attempt_timeout, endpoint.deliver(&self.alert));
        tokio::pin!(delivery);

        loop {
            tokio::select! {
                result = &mut delivery => return Delivery::Finished(result),
                control = self.controls.recv() => {
                    if let Some(response) = classify(control, endpoint_id) {
                        return Delivery::Interrupted(response);
                    }
                }
            }
        }
    }

    /// After a delivery without acknowledgment: wait for the unit's answer
    /// or for the state machine to escalate.
    async fn await_response(&mut self, endpoint_id: &str) -> Response {
        loop {
            if let Some(response) = classify(self.controls.recv().await, endpoint_id) {
                return response;
            }
        }
    }

    /// Controls that arrived while no attempt was pending. Acknowledge and
    /// cancel win over a decline of `endpoint_id`; escalations are spent by
    /// the next attempt going out.
    fn drain_controls(&mut self, endpoint_id: &str) -> Option<Response> {
        let mut pending = None;
        loop {
            let control = match self.controls.try_recv() {
                Ok(control) => Some(control),
                Err(TryRecvError::Disconnected) => None,
                Err(TryRecvError::Empty) => return pending,
            };
            match classify(control, endpoint_id) {
                Some(r @ (Response::Acknowledged(_) | Response::Cancelled)) => return Some(r),
                Some(Response::Declined) => pending = Some(Response::Declined),
                Some(Response::Escalated) => {
                    if pending.is_none() {
                        pending = Some(Response::Escalated);
                    }
                }
                None => {}
            }
        }
    }

    /// Waits out the retry delay. Any decisive control ends the wait early;
    /// an escalation sends the next attempt right away.
    async fn backoff(&mut self, failures: u32, endpoint_id: &str) -> Option<Response> {
        let delay = self.policy.backoff(failures);
        debug!("Backing off {:?} before next attempt", delay);
        let deadline = tokio::time::Instant::now() + delay;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return None,
                control = self.controls.recv() => {
                    if let Some(response) = classify(control, endpoint_id) {
                        return Some(response);
                    }
                }
            }
        }
    }
}

/// Maps a control message to its effect on the attempt pending at
/// `endpoint_id`. A closed channel cancels; a decline from another unit is
/// ignored.
fn classify(control: Option<DispatchControl>, endpoint_id: &str) -> Option<Response> {
    match control {
        Some(DispatchControl::Acknowledge { endpoint }) => Some(Response::Acknowledged(endpoint)),
        Some(DispatchControl::Escalate) => Some(Response::Escalated),
        Some(DispatchControl::Decline { endpoint }) if endpoint == endpoint_id => {
            Some(Response::Declined)
        }
        Some(DispatchControl::Decline { endpoint }) => {
            debug!("Decline from {} ignored, pending on {}", endpoint, endpoint_id);
            None
        }
        Some(DispatchControl::Cancel) | None => Some(Response::Cancelled),
    }
}
