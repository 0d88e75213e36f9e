use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::core::catalog::{Endpoint, Sensitivity};
use crate::core::Observation;
use crate::error::Result;
use crate::http::{HttpMethod, ProbeRequest};
use crate::probes::{body_request, findings_at, Probe, ProbeContext, ProbeKind};

/// Has the engine fuzz every endpoint with GET, and state-changing endpoints
/// additionally with a body in the endpoint's encoding.
pub struct FuzzProbe {
    body: Value,
}

impl FuzzProbe {
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    fn methods_for(endpoint: &Endpoint) -> Vec<HttpMethod> {
        let mut methods = vec![HttpMethod::Get];
        if endpoint.sensitivity == Sensitivity::StateChanging {
            let declared: Vec<HttpMethod> = endpoint.methods.iter().copied().filter(|m| m.carries_body()).collect();
            if declared.is_empty() {
                methods.push(HttpMethod::Post);
            } else {
                methods.extend(declared);
            }
        }
        methods
    }

    fn request(&self, endpoint: &Endpoint, method: HttpMethod, url: Url) -> ProbeRequest {
        if !method.carries_body() {
            return ProbeRequest::get(url);
        }
        match self.body.as_object() {
            Some(fields) => body_request(endpoint, method, url, fields),
            None => ProbeRequest::json(method, url, &self.body),
        }
    }
}

#[async_trait]
impl Probe for FuzzProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Fuzz
    }

    fn applies_to(&self, _endpoint: &Endpoint) -> bool {
        true
    }

    async fn run(&self, ctx: &ProbeContext<'_>) -> Result<Vec<Observation>> {
        let url = ctx.endpoint.url_for(ctx.base, None)?;

        let mut found = Vec::new();
        for method in Self::methods_for(ctx.endpoint) {
            let request = ctx.session.apply(self.request(ctx.endpoint, method, url.clone()));
            let alerts = ctx.engine.run_probe(&request).await?;
            found.extend(findings_at(ctx.endpoint, &url, alerts));
        }
        Ok(found)
    }
}
