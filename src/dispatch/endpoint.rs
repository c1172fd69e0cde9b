// src/dispatch/endpoint.rs
//
// Alert sinks. `HttpEndpoint` posts JSON to an emergency unit's webhook;
// tests plug in their own implementations.

use super::alert::{DeliveryReceipt, DispatchAlert};
use crate::config::EndpointConfig;
use crate::error::{CrashGuardError, Result};
use crate::geo::GeoPoint;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, error, info};

pub type DeliveryFuture<'a> = Pin<Box<dyn Future<Output = Result<DeliveryReceipt>> + Send + 'a>>;

pub trait AlertEndpoint: Send + Sync {
    fn id(&self) -> &str;

    /// Where the unit is stationed, for nearest-first ordering.
    fn position(&self) -> Option<GeoPoint> {
        None
    }

    /// One delivery. The caller bounds it with its own timeout.
    fn deliver<'a>(&'a self, alert: &'a DispatchAlert) -> DeliveryFuture<'a>;
}

pub struct HttpEndpoint {
    id: String,
    url: String,
    position: Option<GeoPoint>,
    http_client: reqwest::Client,
}

impl HttpEndpoint {
    pub fn new(config: &EndpointConfig, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrashGuardError::config(format!("HTTP client for {}: {}", config.id, e)))?;

        Ok(Self {
            id: config.id.clone(),
            url: config.url.clone(),
            position: config.position,
            http_client,
        })
    }

    async fn post(&self, alert: &DispatchAlert) -> Result<DeliveryReceipt> {
        info!(
            "🚑 Sending alert {} for {} (attempt {}) to {}",
            alert.alert_id, alert.incident_id, alert.attempt, self.url
        );

        let response = self
            .http_client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| CrashGuardError::dispatch(&self.id, e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            error!("🚑 {} returned {}: {}", self.id, status, body);
            return Err(CrashGuardError::dispatch(
                &self.id,
                format!("HTTP {}", status),
            ));
        }

        let receipt = DeliveryReceipt::from_body(&body);
        debug!("🚑 {} receipt: {:?}", self.id, receipt);
        Ok(receipt)
    }
}

impl AlertEndpoint for HttpEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn position(&self) -> Option<GeoPoint> {
        self.position
    }

    fn deliver<'a>(&'a self, alert: &'a DispatchAlert) -> DeliveryFuture<'a> {
        Box::pin(self.post(alert))
    }
}
