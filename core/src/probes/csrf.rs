use async_trait::async_trait;

use crate::core::catalog::{Endpoint, Sensitivity};
use crate::core::Observation;
use crate::error::Result;
use crate::probes::{findings_at, Probe, ProbeContext, ProbeKind};

/// Hands the endpoint to the engine's CSRF checks and reports what they raise.
pub struct CsrfProbe;

#[async_trait]
impl Probe for CsrfProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Csrf
    }

    fn applies_to(&self, endpoint: &Endpoint) -> bool {
        endpoint.sensitivity == Sensitivity::StateChanging
    }

    async fn run(&self, ctx: &ProbeContext<'_>) -> Result<Vec<Observation>> {
        let url = ctx.endpoint.url_for(ctx.base, None)?;
        let alerts = ctx.engine.csrf_scan(&url).await?;
        Ok(findings_at(ctx.endpoint, &url, alerts))
    }
}
