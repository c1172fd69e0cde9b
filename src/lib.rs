// src/lib.rs
//
// CrashGuard-S crash detection engine.
//
//   CaptureDevice → FrameSource (capture thread, bounded queue)
//     → SignalExtractor → Detector → IncidentStateMachine (detection thread)
//     → DispatchNotifier (one tokio task per incident) → AlertEndpoint
//
// `CrashGuard` is the entry point: start a session with a config and a
// capture device, then watch its snapshot or subscribe to its events.

pub mod archive;
pub mod clock;
pub mod config;
pub mod detection;
pub mod dispatch;
pub mod error;
pub mod frame_source;
pub mod geo;
pub mod pipeline;
pub mod session;
pub mod signal;
pub mod snapshot;
pub mod types;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::Config;
pub use error::{CrashGuardError, Result};
pub use frame_source::{CaptureDevice, ReplayDevice, SyntheticDevice};
pub use geo::GeoPoint;
pub use pipeline::SessionEvent;
pub use session::{CrashGuard, SessionSnapshot, SessionState};
pub use types::{Incident, IncidentId, IncidentStatus, SessionId};
