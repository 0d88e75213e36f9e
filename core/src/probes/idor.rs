use async_trait::async_trait;

use crate::core::catalog::{Endpoint, Sensitivity};
use crate::core::{Observation, Severity};
use crate::error::Result;
use crate::http::ProbeRequest;
use crate::probes::{Probe, ProbeContext, ProbeKind};

/// Requests an object template with identifiers the session does not own.
pub struct IdorProbe {
    candidate_ids: Vec<String>,
}

impl IdorProbe {
    pub fn new(candidate_ids: Vec<String>) -> Self {
        Self { candidate_ids }
    }
}

#[async_trait]
impl Probe for IdorProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Idor
    }

    fn applies_to(&self, endpoint: &Endpoint) -> bool {
        endpoint.sensitivity == Sensitivity::ObjectReferencing
    }

    async fn run(&self, ctx: &ProbeContext<'_>) -> Result<Vec<Observation>> {
        let mut found = Vec::new();
        for id in self.candidate_ids.iter().filter(|id| !ctx.session.owns(id)) {
            let url = ctx.endpoint.url_for(ctx.base, Some(id.as_str()))?;
            let request = ctx.session.apply(ProbeRequest::get(url.clone()));
            let response = ctx.engine.send_request(&request).await?;
            if !response.is_success() {
                continue;
            }
            found.push(
                Observation::probe(
                    Severity::Medium,
                    Some(ctx.endpoint.reference()),
                    "Insecure direct object reference",
                    format!(
                        "object '{}' is not owned by {} but {} returned HTTP {}",
                        id,
                        ctx.session.principal().unwrap_or("the current session"),
                        ctx.endpoint.path,
                        response.status
                    ),
                )
                .with_url(url.as_str()),
            );
        }
        Ok(found)
    }
}
