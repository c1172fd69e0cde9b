// src/pipeline/mod.rs

pub mod event_bus;
pub mod metrics;
pub mod worker;

pub use event_bus::{log_lag, EventBus, SessionEvent};
pub use metrics::{MetricsSummary, PipelineMetrics};
pub use worker::{DetectionWorker, WorkerCommand};
