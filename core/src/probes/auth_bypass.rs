use async_trait::async_trait;
use log::debug;

use crate::core::catalog::{Endpoint, Sensitivity};
use crate::core::{Observation, Severity};
use crate::error::Result;
use crate::http::ProbeRequest;
use crate::probes::{Probe, ProbeContext, ProbeKind};

/// Requests an auth-required endpoint with no credentials attached.
pub struct AuthBypassProbe {
    denied: Vec<u16>,
}

impl AuthBypassProbe {
    pub fn new(denied: Vec<u16>) -> Self {
        Self { denied }
    }
}

#[async_trait]
impl Probe for AuthBypassProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::AuthBypass
    }

    fn applies_to(&self, endpoint: &Endpoint) -> bool {
        endpoint.sensitivity == Sensitivity::AuthRequired
    }

    async fn run(&self, ctx: &ProbeContext<'_>) -> Result<Vec<Observation>> {
        let url = ctx.endpoint.url_for(ctx.base, None)?;
        // The session is deliberately not applied here.
        let response = ctx.engine.send_request(&ProbeRequest::get(url.clone())).await?;

        if self.denied.contains(&response.status) {
            debug!("{} denied anonymous access with HTTP {}", url, response.status);
            return Ok(Vec::new());
        }

        Ok(vec![Observation::probe(
            Severity::High,
            Some(ctx.endpoint.reference()),
            "Authentication bypass",
            format!(
                "GET {} without credentials returned HTTP {} (expected one of {:?})",
                ctx.endpoint.path, response.status, self.denied
            ),
        )
        .with_url(url.as_str())])
    }
}
