use async_trait::async_trait;
use log::debug;
use regex::Regex;
use serde_json::Value;

use crate::core::catalog::Endpoint;
use crate::core::mutator::{extract_injection_points, mutate_request_with_value};
use crate::core::{Observation, Severity};
use crate::error::Result;
use crate::http::ProbeResponse;
use crate::probes::{seed_requests, Probe, ProbeContext, ProbeKind};

/// Error text a document store leaks when it evaluates an injected operator.
const ERROR_SIGNATURES: &[&str] = &[
    r"(?i)mongo(server|parse)?error",
    r"(?i)\bcasterror\b",
    r"(?i)unknown (top level )?operator",
    r"(?i)\$regex has to be a string",
    r"(?i)bson(type)?\b",
];

/// Body length change that counts as a different result set.
const MIN_LENGTH_DELTA: usize = 32;

/// Submits operator-shaped values and compares each response against the
/// unmodified request's response.
pub struct NoSqlInjectionProbe {
    payloads: Vec<Value>,
    signatures: Vec<Regex>,
}

impl NoSqlInjectionProbe {
    pub fn new(payloads: Vec<Value>) -> Self {
        let signatures = ERROR_SIGNATURES.iter().filter_map(|p| Regex::new(p).ok()).collect();
        Self { payloads, signatures }
    }

    fn leaks_error(&self, body: &str) -> bool {
        self.signatures.iter().any(|re| re.is_match(body))
    }

    /// Why `response` differs materially from `baseline`, if it does.
    fn difference(&self, baseline: &ProbeResponse, response: &ProbeResponse) -> Option<String> {
        if response.status != baseline.status {
            return Some(format!("status changed from {} to {}", baseline.status, response.status));
        }
        if self.leaks_error(&response.body) && !self.leaks_error(&baseline.body) {
            return Some("response contains a database error".to_string());
        }
        let delta = response.body.len().abs_diff(baseline.body.len());
        if delta > MIN_LENGTH_DELTA.max(baseline.body.len() / 10) {
            return Some(format!(
                "body length changed from {} to {} bytes",
                baseline.body.len(),
                response.body.len()
            ));
        }
        None
    }
}

#[async_trait]
impl Probe for NoSqlInjectionProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::NosqlInjection
    }

    fn applies_to(&self, endpoint: &Endpoint) -> bool {
        endpoint.accepts_params()
    }

    async fn run(&self, ctx: &ProbeContext<'_>) -> Result<Vec<Observation>> {
        for seed in seed_requests(ctx.endpoint, ctx.base)? {
            let seed = ctx.session.apply(seed);
            let baseline = ctx.engine.send_request(&seed).await?;

            for point in extract_injection_points(&seed) {
                for payload in &self.payloads {
                    let request = mutate_request_with_value(&seed, &point, payload);
                    let response = ctx.engine.send_request(&request).await?;

                    if let Some(reason) = self.difference(&baseline, &response) {
                        return Ok(vec![Observation::probe(
                            Severity::Medium,
                            Some(ctx.endpoint.reference()),
                            "NoSQL injection",
                            format!(
                                "{} {} with {} = {}: {}",
                                seed.method, ctx.endpoint.path, point, payload, reason
                            ),
                        )
                        .with_url(request.url.as_str())]);
                    }
                }
            }
            debug!("{} {} answered every payload like the baseline", seed.method, ctx.endpoint.path);
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::Sensitivity;
    use crate::core::session::Session;
    use crate::engine::testing::ScriptedEngine;
    use crate::http::{HttpMethod, ProbeRequest};
    use serde_json::json;
    use url::Url;

    fn probe() -> NoSqlInjectionProbe {
        NoSqlInjectionProbe::new(vec![json!({"$gt": ""}), json!({"$where": "this.password == this.username"})])
    }

    async fn run_against(engine: &ScriptedEngine, endpoint: Endpoint) -> Vec<Observation> {
        let base = Url::parse("http://localhost:5000").unwrap();
        let session = Session::unauthenticated();
        let ctx = ProbeContext {
            endpoint: &endpoint,
            session: &session,
            engine,
            base: &base,
        };
        probe().run(&ctx).await.unwrap()
    }

    fn items() -> Endpoint {
        Endpoint::new("/api/items", Sensitivity::StateChanging).with_params(["query"])
    }

    #[tokio::test]
    async fn test_operator_returning_results_is_reported() {
        let engine = ScriptedEngine::new().respond_with("/api/items", |req: &ProbeRequest| {
            let query = req.url.query_pairs().find(|(k, _)| k == "query").map(|(_, v)| v.into_owned());
            if query.as_deref().map_or(false, |q| q.contains("$gt")) {
                ProbeResponse::new(200, r#"[{"name":"a","owner":"alice"},{"name":"b","owner":"bob"}]"#)
            } else {
                ProbeResponse::new(200, "[]")
            }
        });
        let found = run_against(&engine, items()).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].severity, Severity::Medium);
        assert!(found[0].description.contains("body length changed"));
        assert_eq!(engine.sent_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_database_error_is_reported() {
        let engine = ScriptedEngine::new().respond_with("/api/items", |req: &ProbeRequest| {
            if req.url.query().map_or(false, |q| q.contains("%24where")) {
                ProbeResponse::new(200, "MongoServerError: $where not allowed")
            } else {
                ProbeResponse::new(200, "[]")
            }
        });
        let found = run_against(&engine, items()).await;
        assert_eq!(found.len(), 1);
        assert!(found[0].description.contains("database error"));
    }

    #[tokio::test]
    async fn test_identical_responses_are_not_reported() {
        let engine = ScriptedEngine::new().respond("/api/items", ProbeResponse::new(200, "[]"));
        let endpoint = items().with_methods([HttpMethod::Get, HttpMethod::Post]);
        assert!(run_against(&engine, endpoint).await.is_empty());
        // per method: one baseline plus two payloads
        assert_eq!(engine.sent_requests().len(), 6);
    }

    #[tokio::test]
    async fn test_json_body_gets_operator_object() {
        let engine = ScriptedEngine::new().respond("/api/items", ProbeResponse::new(200, "[]"));
        let endpoint = items().with_methods([HttpMethod::Post]);
        run_against(&engine, endpoint).await;
        let sent = engine.sent_requests();
        let injected: Value = serde_json::from_str(&sent[1].body).unwrap();
        assert_eq!(injected, json!({"query": {"$gt": ""}}));
    }

    #[test]
    fn test_small_length_jitter_is_ignored() {
        let p = probe();
        let baseline = ProbeResponse::new(200, "[]");
        assert!(p.difference(&baseline, &ProbeResponse::new(200, "[ ]")).is_none());
        assert!(p.difference(&baseline, &ProbeResponse::new(500, "[]")).is_some());
    }
}
