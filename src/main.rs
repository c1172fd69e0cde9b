// src/main.rs

use anyhow::{Context, Result};
use crashguard::config::SourceKind;
use crashguard::pipeline::log_lag;
use crashguard::{CaptureDevice, Config, CrashGuard, ReplayDevice, SessionEvent, SyntheticDevice};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("CRASHGUARD_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚑 CrashGuard-S starting");
    info!("✓ Configuration loaded from {}", config_path);
    info!(
        "Detection thresholds: suspicious={:.2}, impact={:.2}, debounce={} frames / {} ms",
        config.detection.suspicious_threshold,
        config.detection.impact_threshold,
        config.incident.debounce_count,
        config.incident.debounce_window_ms
    );

    let device = build_device(&config)?;
    let guard = Arc::new(CrashGuard::new(tokio::runtime::Handle::current()));
    let session_id = guard
        .start_session(config, device)
        .context("Failed to start session")?;
    info!("✓ Session {} running, Ctrl-C to stop", session_id);

    let mut events = guard.subscribe(&session_id)?;
    let event_log = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::SessionStopped { session_id }) => {
                    info!("Session {} reported stopped", session_id);
                    break;
                }
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => log_lag(skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Stop requested");

    // Taken before stopping: a stopped session is released by the guard.
    let mut watch = guard.watch(&session_id)?;
    let stopper = Arc::clone(&guard);
    let id = session_id.clone();
    let snapshot = tokio::task::spawn_blocking(move || stopper.stop_session(&id)).await??;

    info!("\n========================================");
    info!("Session {} ({:?})", snapshot.session_id, snapshot.state);
    info!("  Frames captured: {}", snapshot.metrics.frames_captured);
    info!("  Frames dropped: {}", snapshot.metrics.frames_dropped);
    info!("  Incidents opened: {}", snapshot.metrics.incidents_opened);
    info!("  🚨 Confirmed: {}", snapshot.metrics.incidents_confirmed);
    info!("  ✅ Acknowledged: {}", snapshot.metrics.incidents_acknowledged);
    if snapshot.metrics.incidents_expired > 0 {
        warn!("  ⏱️  Expired: {}", snapshot.metrics.incidents_expired);
    }
    info!("  Processing Speed: {:.1} FPS", snapshot.metrics.fps);
    info!("========================================\n");

    if let Some(incident) = &snapshot.current_incident {
        warn!(
            "{} still {} at shutdown, dispatch continues until it closes",
            incident.id,
            incident.status.as_str()
        );
        while watch.borrow_and_update().current_incident.is_some() {
            if watch.changed().await.is_err() {
                break;
            }
        }
    }

    if let Err(e) = event_log.await {
        error!("Event logger failed: {}", e);
    }
    Ok(())
}

fn build_device(config: &Config) -> Result<Box<dyn CaptureDevice>> {
    let source = &config.source;
    let device: Box<dyn CaptureDevice> = match source.kind {
        SourceKind::Synthetic => Box::new(SyntheticDevice::new(source.synthetic.clone())),
        SourceKind::Replay => Box::new(ReplayDevice::new(&source.replay_dir)),
        #[cfg(feature = "camera")]
        SourceKind::Camera => Box::new(crashguard::frame_source::CameraDevice::new(
            source.camera_index,
            source.video_path.clone(),
        )),
        #[cfg(not(feature = "camera"))]
        SourceKind::Camera => anyhow::bail!("camera source requires the `camera` feature"),
    };
    Ok(device)
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::IncidentOpened(i) => info!("⚠️  {} opened (score {:.2})", i.id, i.severity),
        SessionEvent::IncidentConfirmed(i) => {
            warn!("🚨 CRASH CONFIRMED: {} severity {:.2}", i.id, i.severity)
        }
        SessionEvent::IncidentDispatched(i) => info!("📡 {} dispatched", i.id),
        SessionEvent::IncidentEscalated(i) => {
            warn!("⏫ {} escalated ({} so far)", i.id, i.escalations)
        }
        SessionEvent::IncidentAcknowledged(i) => info!(
            "✅ {} acknowledged by {}",
            i.id,
            i.acknowledged_by.as_deref().unwrap_or("unknown")
        ),
        SessionEvent::IncidentExpired { incident, reason } => {
            error!("⏱️  {} expired ({:?})", incident.id, reason)
        }
        SessionEvent::IncidentCancelled(i) => info!("{} cancelled", i.id),
        SessionEvent::DispatchAttemptRecorded(a) => info!(
            "  attempt {} to {}: {:?}",
            a.attempt, a.endpoint_id, a.outcome
        ),
        SessionEvent::SourceDegraded { reason } => error!("📷 Source degraded: {}", reason),
        SessionEvent::SessionStopped { .. } => {}
    }
}
