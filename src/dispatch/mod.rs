// src/dispatch/mod.rs
//
// Alert delivery to emergency units.

pub mod alert;
pub mod endpoint;
pub mod notifier;

pub use alert::{AlertOrigin, DeliveryReceipt, DispatchAlert};
pub use endpoint::{AlertEndpoint, DeliveryFuture, HttpEndpoint};
pub use notifier::{DispatchFeedback, DispatchNotifier, RetryPolicy};
