// src/detection/mod.rs
//
// Per-frame scoring and the incident lifecycle built on top of it.
//
//   FeatureVector → Detector (windowed score) → Classification
//   Classification → IncidentStateMachine → Transition(s)

mod detector;
mod state_machine;

pub use detector::{Detector, WindowedDetector};
pub use state_machine::{
    DetectionPhase, ExpiryReason, IncidentStateMachine, StaleTransition, Transition,
};
