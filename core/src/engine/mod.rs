#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod zap;

pub use zap::ZapEngine;

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::{EndpointRef, Observation, ObservationSource, Severity};
use crate::error::Result;
use crate::http::{ProbeRequest, ProbeResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanPhase {
    Spider,
    ActiveScan,
}

impl std::fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanPhase::Spider => write!(f, "spider"),
            ScanPhase::ActiveScan => write!(f, "active scan"),
        }
    }
}

/// An engine-side scan in flight. Consumed once the scan is observed complete
/// or abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanHandle {
    pub phase: ScanPhase,
    pub id: String,
    pub started_at: DateTime<Utc>,
}

impl ScanHandle {
    pub fn new(phase: ScanPhase, id: impl Into<String>) -> Self {
        Self {
            phase,
            id: id.into(),
            started_at: Utc::now(),
        }
    }
}

/// One alert as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineAlert {
    pub id: String,
    pub plugin_id: String,
    pub name: String,
    pub risk: String,
    pub url: String,
    pub param: String,
    pub description: String,
}

impl EngineAlert {
    pub fn severity(&self) -> Severity {
        Severity::from_risk(&self.risk)
    }

    /// Path component of the alert URL, if it parses.
    pub fn path(&self) -> Option<String> {
        Url::parse(&self.url).ok().map(|u| u.path().to_string())
    }

    pub fn into_observation(self, source: ObservationSource, endpoint: Option<EndpointRef>) -> Observation {
        let severity = self.severity();
        let mut description = self.description;
        if !self.param.is_empty() {
            description = format!("{} (parameter: {})", description, self.param);
        }
        Observation {
            source,
            severity,
            endpoint,
            title: self.name,
            description,
            url: if self.url.is_empty() { None } else { Some(self.url) },
            alert_id: if self.id.is_empty() { None } else { Some(self.id) },
        }
    }
}

/// Typed view of the external scanning engine's control API.
///
/// Every call either returns a value or fails with `EngineUnreachable` /
/// `EngineError`; an implementation must never map a failure to an empty
/// result.
#[async_trait]
pub trait ScanEngine: Send + Sync {
    /// Makes the engine fetch `url` once so it enters the site tree.
    async fn access_url(&self, _url: &Url) -> Result<()> {
        Ok(())
    }

    async fn start_spider(&self, target: &Url) -> Result<ScanHandle>;

    async fn start_active_scan(&self, target: &Url) -> Result<ScanHandle>;

    /// Completion percentage of a running scan, in `[0, 100]`.
    async fn poll_status(&self, handle: &ScanHandle) -> Result<u8>;

    async fn stop_scan(&self, _handle: &ScanHandle) -> Result<()> {
        Ok(())
    }

    /// Records still waiting for the passive scanner.
    async fn passive_queue_len(&self) -> Result<u64> {
        Ok(0)
    }

    /// Sends one request to the target through the engine's proxy.
    async fn send_request(&self, request: &ProbeRequest) -> Result<ProbeResponse>;

    /// Has the engine fuzz a single request and returns the alerts it holds
    /// for URLs under the request's URL.
    async fn run_probe(&self, request: &ProbeRequest) -> Result<Vec<EngineAlert>>;

    /// Runs the engine's CSRF checks against `url`.
    async fn csrf_scan(&self, url: &Url) -> Result<Vec<EngineAlert>>;

    async fn list_hosts(&self) -> Result<BTreeSet<String>>;

    async fn list_alerts(&self, base: &Url) -> Result<Vec<EngineAlert>>;

    /// The engine's own HTML report.
    async fn render_report(&self) -> Result<Vec<u8>>;
}
