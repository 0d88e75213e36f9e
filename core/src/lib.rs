pub mod core;
pub mod engine;
pub mod error;
pub mod http;
pub mod probes;
pub mod reporting;
pub mod utils;

use std::path::Path;
use std::sync::{Arc, Mutex};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use url::Url;

pub use crate::core::catalog::{BodyEncoding, Endpoint, EndpointCatalog, Sensitivity};
pub use crate::core::clock::{Clock, ManualClock, TokioClock};
pub use crate::core::orchestrator::{CancelFlag, PhaseOrchestrator, RunOutcome, RunState};
pub use crate::core::result_aggregator::{persist, render, Report, ReportFormat, ResultAggregator};
pub use crate::core::session::{Session, SessionConfig};
pub use crate::core::{EndpointRef, Observation, ObservationSource, Severity};
pub use crate::engine::{ScanEngine, ZapEngine};
pub use crate::error::{RunFailure, ScanError};
pub use crate::http::HttpMethod;
pub use crate::probes::{ProbeKind, ProbeSettings, ProbeSuite};
pub use crate::utils::read_lines;

/// Run configuration shared by the CLI and library callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanConfig {
    pub target: String,
    /// Address of the engine's proxy / control API.
    pub engine_addr: String,
    pub api_key: String,
    /// Seconds between status polls.
    pub poll_interval: u64,
    /// Upper bound, in seconds, on the wait for any single phase.
    pub phase_timeout: u64,
    /// Per-call timeout for the control API, in seconds.
    pub request_timeout: u64,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    /// Probes in flight at once.
    pub threads: usize,
    pub endpoints: Vec<Endpoint>,
    pub enabled_probes: Vec<ProbeKind>,
    pub probes: ProbeSettings,
    pub session: SessionConfig,
    pub output: String,
    pub format: ReportFormat,
    /// Where to write the engine's own HTML report, if anywhere.
    pub engine_report: Option<String>,
    pub drain_passive: bool,
    pub skip_active: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            engine_addr: "http://127.0.0.1:8080".to_string(),
            api_key: String::new(),
            poll_interval: 2,
            phase_timeout: 3600,
            request_timeout: 30,
            retry_attempts: 3,
            retry_base_ms: 500,
            threads: 4,
            endpoints: Vec::new(),
            enabled_probes: ProbeKind::ALL.to_vec(),
            probes: ProbeSettings::default(),
            session: SessionConfig::default(),
            output: "zapflow-report.html".to_string(),
            format: ReportFormat::Html,
            engine_report: None,
            drain_passive: true,
            skip_active: false,
        }
    }
}

impl ScanConfig {
    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> error::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ScanError::InvalidConfig(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw).map_err(|e| ScanError::InvalidConfig(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> error::Result<()> {
        let invalid = |msg: &str| Err(ScanError::InvalidConfig(msg.to_string()));
        if self.target.trim().is_empty() {
            return invalid("target is empty");
        }
        self.target_url()?;
        if self.engine_addr.trim().is_empty() {
            return invalid("engine address is empty");
        }
        if self.poll_interval == 0 {
            return invalid("poll interval must be at least one second");
        }
        if self.phase_timeout == 0 {
            return invalid("phase timeout must be at least one second");
        }
        if self.poll_interval > self.phase_timeout {
            return invalid("poll interval is longer than the phase timeout");
        }
        if self.request_timeout == 0 {
            return invalid("request timeout must be at least one second");
        }
        if self.threads == 0 {
            return invalid("threads must be at least 1");
        }
        Ok(())
    }

    pub fn target_url(&self) -> error::Result<Url> {
        let url = Url::parse(self.target.trim())
            .map_err(|e| ScanError::InvalidConfig(format!("target '{}': {}", self.target, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ScanError::InvalidConfig(format!(
                "target '{}' uses unsupported scheme '{}'",
                self.target, other
            ))),
        }
    }

    pub fn api_key_ref(&self) -> Option<&str> {
        if self.api_key.is_empty() { None } else { Some(&self.api_key) }
    }
}

pub fn parse_custom_headers(raw: &[String]) -> Vec<(String, String)> {
    raw.iter().filter_map(|h| {
        let mut parts = h.splitn(2, ':');
        let key = parts.next()?.trim().to_string();
        let val = parts.next().unwrap_or("").trim().to_string();
        if key.is_empty() { return None; }
        Some((key, val))
    }).collect()
}

/// Output abstraction for a scan run.
/// The CLI implements this with colored terminal output.
pub trait ScanEventSink: Send + Sync {
    fn on_log(&self, level: &str, message: &str);
    fn on_observation(&self, observation: &Observation);
    fn on_progress(&self, phase: &str, current: usize, total: usize);
    fn on_state(&self, state: RunState);
}

pub type SinkRef = Arc<dyn ScanEventSink>;

/// Discards every event.
pub struct NullSink;

impl ScanEventSink for NullSink {
    fn on_log(&self, _level: &str, _message: &str) {}
    fn on_observation(&self, _observation: &Observation) {}
    fn on_progress(&self, _phase: &str, _current: usize, _total: usize) {}
    fn on_state(&self, _state: RunState) {}
}

/// Terminal output sink for CLI usage.
#[derive(Default)]
pub struct ConsoleSink {
    bar: Mutex<Option<(String, ProgressBar)>>,
}

impl ConsoleSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self::default())
    }

    fn emit(&self, text: &str) {
        use std::io::Write;
        if let Ok(guard) = self.bar.lock() {
            if let Some((_, ref bar)) = *guard {
                bar.println(text);
                return;
            }
        }
        print!("{}\r\n", text);
        std::io::stdout().flush().ok();
    }
}

impl ScanEventSink for ConsoleSink {
    fn on_log(&self, level: &str, message: &str) {
        use colored::*;
        let colored = match level {
            "success" => message.green().to_string(),
            "error"   => message.red().to_string(),
            "warn"    => message.yellow().to_string(),
            "phase"   => message.bright_cyan().bold().to_string(),
            _         => message.to_string(),
        };
        self.emit(&colored);
    }

    fn on_observation(&self, observation: &Observation) {
        use colored::*;
        let severity = match observation.severity {
            Severity::High => "High".red().bold(),
            Severity::Medium => "Medium".yellow().bold(),
            Severity::Low => "Low".blue(),
            Severity::Info => "Info".dimmed(),
        };
        self.emit(&format!(
            "{} [{}] {} {}",
            "[+]".green().bold(),
            severity,
            observation.title.white().bold(),
            format!("({})", observation.source).dimmed()
        ));
        if let Some(ref endpoint) = observation.endpoint {
            self.emit(&format!("    Endpoint: {}", endpoint.to_string().cyan()));
        }
        if let Some(ref url) = observation.url {
            self.emit(&format!("    URL:      {}", url.white()));
        }
        if !observation.description.is_empty() {
            self.emit(&format!("    {}", observation.description.dimmed()));
        }
    }

    fn on_progress(&self, phase: &str, current: usize, total: usize) {
        use colored::*;
        if total == 0 {
            self.emit(&format!("[*] {}", phase).bright_cyan().to_string());
            return;
        }
        let Ok(mut guard) = self.bar.lock() else { return };
        let stale = !matches!(*guard, Some((ref name, _)) if name == phase);
        if stale {
            if let Some((_, old)) = guard.take() {
                old.finish_and_clear();
            }
            let bar = ProgressBar::new(total as u64);
            let style = ProgressStyle::with_template("{spinner:.cyan} {msg:>14} [{bar:30.cyan/blue}] {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.set_message(phase.to_string());
            *guard = Some((phase.to_string(), bar));
        }
        if let Some((_, ref bar)) = *guard {
            bar.set_position(current as u64);
        }
        if current >= total {
            if let Some((_, bar)) = guard.take() {
                bar.finish_and_clear();
            }
        }
    }

    fn on_state(&self, state: RunState) {
        use colored::*;
        let line = match state {
            RunState::Done => format!("[*] {}", state).green().bold().to_string(),
            RunState::Failed | RunState::Cancelled => format!("[!] {}", state).red().bold().to_string(),
            _ => format!("[*] {}", state).bright_cyan().bold().to_string(),
        };
        self.emit(&line);
    }
}
