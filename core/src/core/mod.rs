pub mod backoff;
pub mod catalog;
pub mod clock;
pub mod mutator;
pub mod orchestrator;
pub mod result_aggregator;
pub mod session;

use serde::{Deserialize, Serialize};

use crate::core::catalog::Sensitivity;

/// Severity scale shared by engine alerts and probe findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
}

impl Severity {
    /// Maps the engine's risk label ("Informational", "Low", ...) onto the scale.
    pub fn from_risk(risk: &str) -> Self {
        match risk.trim().to_ascii_lowercase().as_str() {
            "high" | "critical" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Info,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "Info"),
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObservationSource {
    PassiveAlert,
    ActiveAlert,
    ProbeFinding,
}

impl std::fmt::Display for ObservationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationSource::PassiveAlert => write!(f, "Passive"),
            ObservationSource::ActiveAlert => write!(f, "Active"),
            ObservationSource::ProbeFinding => write!(f, "Probe"),
        }
    }
}

/// Reference to a catalog entry. Two entries may share a path when they carry
/// different sensitivity classes, so both fields form the identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointRef {
    pub path: String,
    pub sensitivity: Sensitivity,
}

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path, self.sensitivity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub source: ObservationSource,
    pub severity: Severity,
    pub endpoint: Option<EndpointRef>,
    /// Short title, e.g. the engine alert name or the probe that raised it.
    pub title: String,
    pub description: String,
    /// Concrete URL the observation was made against, when known.
    pub url: Option<String>,
    /// Engine-side alert id, used to avoid counting one alert twice.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_id: Option<String>,
}

impl Observation {
    pub fn probe(
        severity: Severity,
        endpoint: Option<EndpointRef>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            source: ObservationSource::ProbeFinding,
            severity,
            endpoint,
            title: title.into(),
            description: description.into(),
            url: None,
            alert_id: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_engine_risk() {
        assert_eq!(Severity::from_risk("Informational"), Severity::Info);
        assert_eq!(Severity::from_risk("Low"), Severity::Low);
        assert_eq!(Severity::from_risk("medium"), Severity::Medium);
        assert_eq!(Severity::from_risk(" High "), Severity::High);
        assert_eq!(Severity::from_risk("False Positive"), Severity::Info);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Low > Severity::Info);
    }
}
