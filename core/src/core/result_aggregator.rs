use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::core::catalog::EndpointCatalog;
use crate::core::{EndpointRef, Observation, Severity};
use crate::error::{Result, ScanError};
use crate::reporting;

/// Terminal artifact of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub target: String,
    pub hosts_scanned: BTreeSet<String>,
    pub observations: Vec<Observation>,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn count_by_severity(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for obs in &self.observations {
            *counts.entry(obs.severity).or_insert(0) += 1;
        }
        counts
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.observations.iter().filter(|o| o.severity == severity).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Html,
    Json,
}

impl FromStr for ReportFormat {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "html" => Ok(ReportFormat::Html),
            "json" => Ok(ReportFormat::Json),
            other => Err(ScanError::InvalidConfig(format!("unknown report format '{}'", other))),
        }
    }
}

/// Collects observations from every phase into one ordered report.
///
/// Appends are keyed by batch id: re-adding a batch that was already
/// accepted is a no-op, so a retried hand-off cannot duplicate entries.
pub struct ResultAggregator {
    target: String,
    catalog: HashSet<EndpointRef>,
    observations: Vec<Observation>,
    seen_batches: HashSet<String>,
    seen_alerts: HashSet<String>,
    hosts: BTreeSet<String>,
}

impl ResultAggregator {
    pub fn new(target: impl Into<String>, catalog: &EndpointCatalog) -> Self {
        Self {
            target: target.into(),
            catalog: catalog.references(),
            observations: Vec::new(),
            seen_batches: HashSet::new(),
            seen_alerts: HashSet::new(),
            hosts: BTreeSet::new(),
        }
    }

    /// Appends `observations` in order. Returns how many were appended.
    pub fn add(&mut self, batch_id: &str, observations: Vec<Observation>) -> usize {
        if !self.seen_batches.insert(batch_id.to_string()) {
            debug!("Batch {} already aggregated, skipping", batch_id);
            return 0;
        }

        let before = self.observations.len();
        for mut obs in observations {
            if let Some(ref endpoint) = obs.endpoint {
                if !self.catalog.contains(endpoint) {
                    warn!("Observation '{}' references {} which is not in the catalog", obs.title, endpoint);
                    obs.endpoint = None;
                }
            }
            if let Some(ref id) = obs.alert_id {
                if !self.seen_alerts.insert(id.clone()) {
                    continue;
                }
            }
            self.observations.push(obs);
        }
        self.observations.len() - before
    }

    pub fn hosts(&mut self, hosts: impl IntoIterator<Item = String>) {
        self.hosts.extend(hosts);
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn build(&self) -> Report {
        self.build_at(Utc::now())
    }

    /// Builds the report with a fixed timestamp.
    pub fn build_at(&self, generated_at: DateTime<Utc>) -> Report {
        Report {
            target: self.target.clone(),
            hosts_scanned: self.hosts.clone(),
            observations: self.observations.clone(),
            generated_at,
        }
    }
}

/// Serializes a report. Output depends only on `report` and `format`.
pub fn render(report: &Report, format: ReportFormat) -> Vec<u8> {
    match format {
        ReportFormat::Html => reporting::generate_html_report(report).into_bytes(),
        ReportFormat::Json => serde_json::to_vec_pretty(report)
            .unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e).into_bytes()),
    }
}

/// Writes `bytes` to `path` atomically: a sibling `.tmp` file is written,
/// synced, then renamed over the destination. The temp file is removed on
/// any failure.
pub fn persist(bytes: &[u8], path: &Path) -> Result<()> {
    let tmp = tmp_path(path);
    let persist_err = |source| ScanError::ReportPersist {
        path: path.to_path_buf(),
        source,
    };

    let written = write_and_sync(&tmp, bytes).and_then(|_| fs::rename(&tmp, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(persist_err(e));
    }
    Ok(())
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
