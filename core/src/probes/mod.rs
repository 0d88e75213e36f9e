pub mod auth_bypass;
pub mod csrf;
pub mod fuzz;
pub mod idor;
pub mod nosql;
pub mod sensitive_data;
pub mod xss;

use std::str::FromStr;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use url::Url;

use crate::core::catalog::{BodyEncoding, Endpoint, EndpointCatalog};
use crate::core::session::Session;
use crate::core::{Observation, ObservationSource};
use crate::engine::{EngineAlert, ScanEngine};
use crate::error::{Result, ScanError};
use crate::http::{HttpMethod, ProbeRequest};

pub use auth_bypass::AuthBypassProbe;
pub use csrf::CsrfProbe;
pub use fuzz::FuzzProbe;
pub use idor::IdorProbe;
pub use nosql::NoSqlInjectionProbe;
pub use sensitive_data::SensitiveDataProbe;
pub use xss::XssProbe;

/// Value every declared parameter carries in an unmodified seed request.
pub const SEED_VALUE: &str = "test";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    AuthBypass,
    Csrf,
    Xss,
    NosqlInjection,
    SensitiveData,
    Idor,
    Fuzz,
}

impl ProbeKind {
    /// Every kind, in registration order.
    pub const ALL: [ProbeKind; 7] = [
        ProbeKind::AuthBypass,
        ProbeKind::Csrf,
        ProbeKind::Xss,
        ProbeKind::NosqlInjection,
        ProbeKind::SensitiveData,
        ProbeKind::Idor,
        ProbeKind::Fuzz,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::AuthBypass => "auth-bypass",
            ProbeKind::Csrf => "csrf",
            ProbeKind::Xss => "xss",
            ProbeKind::NosqlInjection => "nosql-injection",
            ProbeKind::SensitiveData => "sensitive-data",
            ProbeKind::Idor => "idor",
            ProbeKind::Fuzz => "fuzz",
        }
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeKind {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        ProbeKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| ScanError::InvalidConfig(format!("unknown probe '{}'", s.trim())))
    }
}

/// Tunables shared by the standard probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeSettings {
    /// Statuses that count as "access denied" for the auth-bypass probe.
    pub denied_statuses: Vec<u16>,
    pub xss_marker: String,
    /// Operator-shaped values submitted by the NoSQL injection probe.
    pub nosql_payloads: Vec<Value>,
    pub sensitive_fields: Vec<String>,
    /// Object ids the IDOR probe tries; ids the session owns are skipped.
    pub foreign_ids: Vec<String>,
    /// Body the engine fuzzes state-changing endpoints with.
    pub fuzz_body: Value,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            denied_statuses: vec![401, 403],
            xss_marker: "<script>alert(1)</script>".to_string(),
            nosql_payloads: vec![
                json!({"$gt": ""}),
                json!({"$where": "this.password == this.username"}),
            ],
            sensitive_fields: vec!["password".to_string(), "token".to_string()],
            foreign_ids: vec![
                "1".to_string(),
                "2".to_string(),
                "admin".to_string(),
                "999999".to_string(),
            ],
            fuzz_body: json!({"test": "data"}),
        }
    }
}

/// Everything a probe may read while it runs. Nothing here is mutable.
pub struct ProbeContext<'a> {
    pub endpoint: &'a Endpoint,
    pub session: &'a Session,
    pub engine: &'a dyn ScanEngine,
    pub base: &'a Url,
}

#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> ProbeKind;

    fn applies_to(&self, endpoint: &Endpoint) -> bool;

    /// Engine failures are returned as errors, never as an empty result.
    async fn run(&self, ctx: &ProbeContext<'_>) -> Result<Vec<Observation>>;
}

/// One cell of the probe matrix.
pub struct PlannedProbe<'a> {
    pub endpoint: &'a Endpoint,
    pub probe: &'a dyn Probe,
}

/// Registry of probes, kept in registration order.
#[derive(Default)]
pub struct ProbeSuite {
    probes: Vec<Box<dyn Probe>>,
}

impl ProbeSuite {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in probes for the `enabled` kinds, in [`ProbeKind::ALL`] order.
    pub fn standard(settings: &ProbeSettings, enabled: &[ProbeKind]) -> Self {
        let mut suite = Self::new();
        for kind in ProbeKind::ALL.iter().filter(|k| enabled.contains(*k)) {
            match kind {
                ProbeKind::AuthBypass => suite.register(AuthBypassProbe::new(settings.denied_statuses.clone())),
                ProbeKind::Csrf => suite.register(CsrfProbe),
                ProbeKind::Xss => suite.register(XssProbe::new(settings.xss_marker.clone())),
                ProbeKind::NosqlInjection => {
                    suite.register(NoSqlInjectionProbe::new(settings.nosql_payloads.clone()))
                }
                ProbeKind::SensitiveData => {
                    suite.register(SensitiveDataProbe::new(settings.sensitive_fields.clone()))
                }
                ProbeKind::Idor => suite.register(IdorProbe::new(settings.foreign_ids.clone())),
                ProbeKind::Fuzz => suite.register(FuzzProbe::new(settings.fuzz_body.clone())),
            }
        }
        suite
    }

    pub fn register(&mut self, probe: impl Probe + 'static) {
        self.probes.push(Box::new(probe));
    }

    pub fn kinds(&self) -> Vec<ProbeKind> {
        self.probes.iter().map(|p| p.kind()).collect()
    }

    /// Applicable (endpoint, probe) pairs: catalog order, then registration order.
    pub fn plan<'a>(&'a self, catalog: &'a EndpointCatalog) -> Vec<PlannedProbe<'a>> {
        catalog
            .iter()
            .flat_map(|endpoint| {
                self.probes
                    .iter()
                    .filter(move |p| p.applies_to(endpoint))
                    .map(move |p| PlannedProbe {
                        endpoint,
                        probe: &**p,
                    })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

/// One unmodified request per declared method, every parameter set to
/// [`SEED_VALUE`]. Body-carrying methods send the parameters as JSON, the
/// rest as query parameters.
pub fn seed_requests(endpoint: &Endpoint, base: &Url) -> Result<Vec<ProbeRequest>> {
    let url = endpoint.url_for(base, None)?;
    Ok(endpoint
        .methods
        .iter()
        .map(|method| seed_request(endpoint, url.clone(), *method))
        .collect())
}

fn seed_request(endpoint: &Endpoint, mut url: Url, method: HttpMethod) -> ProbeRequest {
    if method.carries_body() {
        let fields: Map<String, Value> = endpoint
            .params
            .iter()
            .map(|p| (p.clone(), Value::String(SEED_VALUE.to_string())))
            .collect();
        return body_request(endpoint, method, url, &fields);
    }
    if endpoint.accepts_params() {
        let mut query = url.query_pairs_mut();
        for param in &endpoint.params {
            query.append_pair(param, SEED_VALUE);
        }
    }
    ProbeRequest::new(method, url, HeaderMap::new(), String::new())
}

/// A request carrying `fields` in the endpoint's body encoding. Form bodies
/// get non-string values as their JSON text.
pub fn body_request(endpoint: &Endpoint, method: HttpMethod, url: Url, fields: &Map<String, Value>) -> ProbeRequest {
    match endpoint.body_encoding {
        BodyEncoding::Json => ProbeRequest::json(method, url, &Value::Object(fields.clone())),
        BodyEncoding::Form => {
            let pairs: Vec<(&str, String)> = fields
                .iter()
                .map(|(k, v)| {
                    let text = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.as_str(), text)
                })
                .collect();
            ProbeRequest::form(method, url, &pairs)
        }
    }
}

/// Findings for the alerts the engine raised against `url` itself. Alerts
/// for other paths belong to other endpoints and are left to the final sweep.
pub fn findings_at(endpoint: &Endpoint, url: &Url, alerts: Vec<EngineAlert>) -> Vec<Observation> {
    alerts
        .into_iter()
        .filter(|a| a.path().as_deref() == Some(url.path()))
        .map(|a| a.into_observation(ObservationSource::ProbeFinding, Some(endpoint.reference())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::Sensitivity;

    fn catalog() -> EndpointCatalog {
        EndpointCatalog::from_endpoints(vec![
            Endpoint::new("/", Sensitivity::Public),
            Endpoint::new("/auth/user", Sensitivity::AuthRequired),
            Endpoint::new("/api/items", Sensitivity::StateChanging)
                .with_methods([HttpMethod::Get, HttpMethod::Post])
                .with_params(["query"]),
            Endpoint::new("/api/items/{id}", Sensitivity::ObjectReferencing),
        ])
        .unwrap()
    }

    fn matrix(suite: &ProbeSuite, catalog: &EndpointCatalog) -> Vec<(String, ProbeKind)> {
        suite
            .plan(catalog)
            .iter()
            .map(|p| (p.endpoint.path.clone(), p.probe.kind()))
            .collect()
    }

    #[test]
    fn test_plan_follows_applicability_and_order() {
        let suite = ProbeSuite::standard(&ProbeSettings::default(), &ProbeKind::ALL);
        let catalog = catalog();
        assert_eq!(
            matrix(&suite, &catalog),
            vec![
                ("/".to_string(), ProbeKind::Fuzz),
                ("/auth/user".to_string(), ProbeKind::AuthBypass),
                ("/auth/user".to_string(), ProbeKind::SensitiveData),
                ("/auth/user".to_string(), ProbeKind::Fuzz),
                ("/api/items".to_string(), ProbeKind::Csrf),
                ("/api/items".to_string(), ProbeKind::Xss),
                ("/api/items".to_string(), ProbeKind::NosqlInjection),
                ("/api/items".to_string(), ProbeKind::Fuzz),
                ("/api/items/{id}".to_string(), ProbeKind::Idor),
                ("/api/items/{id}".to_string(), ProbeKind::Fuzz),
            ]
        );
    }

    #[test]
    fn test_disabled_probes_are_not_registered() {
        let suite = ProbeSuite::standard(&ProbeSettings::default(), &[ProbeKind::Idor, ProbeKind::Csrf]);
        assert_eq!(suite.kinds(), vec![ProbeKind::Csrf, ProbeKind::Idor]);
    }

    #[test]
    fn test_csrf_never_planned_for_public() {
        let suite = ProbeSuite::standard(&ProbeSettings::default(), &[ProbeKind::Csrf]);
        let catalog = EndpointCatalog::from_endpoints(vec![Endpoint::new("/", Sensitivity::Public)]).unwrap();
        assert!(suite.plan(&catalog).is_empty());
    }

    #[test]
    fn test_probe_kind_parse() {
        assert_eq!("NoSQL-Injection".parse::<ProbeKind>().unwrap(), ProbeKind::NosqlInjection);
        assert!("sqli".parse::<ProbeKind>().is_err());
        let kinds: Vec<ProbeKind> = serde_json::from_str(r#"["auth-bypass","sensitive-data"]"#).unwrap();
        assert_eq!(kinds, vec![ProbeKind::AuthBypass, ProbeKind::SensitiveData]);
    }

    #[test]
    fn test_seed_requests_per_method() {
        let base = Url::parse("http://localhost:5000").unwrap();
        let ep = Endpoint::new("/api/items", Sensitivity::StateChanging)
            .with_methods([HttpMethod::Get, HttpMethod::Post])
            .with_params(["query", "limit"]);
        let seeds = seed_requests(&ep, &base).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].method, HttpMethod::Get);
        assert_eq!(seeds[0].url.as_str(), "http://localhost:5000/api/items?query=test&limit=test");
        assert_eq!(seeds[1].method, HttpMethod::Post);
        let body: Value = serde_json::from_str(&seeds[1].body).unwrap();
        assert_eq!(body, json!({"query": "test", "limit": "test"}));
    }

    #[test]
    fn test_form_endpoint_seeds_form_body() {
        let base = Url::parse("http://localhost:5000").unwrap();
        let ep = Endpoint::new("/", Sensitivity::StateChanging)
            .with_methods([HttpMethod::Post])
            .with_params(["customText"])
            .with_body_encoding(BodyEncoding::Form);
        let seeds = seed_requests(&ep, &base).unwrap();
        assert_eq!(seeds[0].body, "customText=test");
        assert_eq!(seeds[0].body_type, crate::http::BodyType::FormUrlEncoded);
    }

    #[test]
    fn test_findings_keep_only_alerts_for_the_probed_url() {
        let ep = Endpoint::new("/", Sensitivity::Public);
        let url = ep.url_for(&Url::parse("http://localhost:5000").unwrap(), None).unwrap();
        let at = |id: &str, url: &str| EngineAlert {
            id: id.into(),
            risk: "Low".into(),
            url: url.into(),
            ..Default::default()
        };
        let found = findings_at(
            &ep,
            &url,
            vec![
                at("1", "http://localhost:5000/"),
                at("2", "http://localhost:5000/api/items/2"),
                at("3", ""),
            ],
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].alert_id.as_deref(), Some("1"));
        assert_eq!(found[0].endpoint, Some(ep.reference()));
    }
}
