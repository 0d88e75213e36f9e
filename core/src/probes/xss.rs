use async_trait::async_trait;
use log::debug;

use crate::core::catalog::Endpoint;
use crate::core::mutator::{extract_injection_points, mutate_request};
use crate::core::{Observation, Severity};
use crate::error::Result;
use crate::probes::{seed_requests, Probe, ProbeContext, ProbeKind};

/// Injects a marker into every parameter and looks for it, unescaped, in the
/// response body. Stops at the first reflection.
pub struct XssProbe {
    marker: String,
}

impl XssProbe {
    pub fn new(marker: String) -> Self {
        Self { marker }
    }
}

#[async_trait]
impl Probe for XssProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Xss
    }

    fn applies_to(&self, endpoint: &Endpoint) -> bool {
        endpoint.accepts_params()
    }

    async fn run(&self, ctx: &ProbeContext<'_>) -> Result<Vec<Observation>> {
        for seed in seed_requests(ctx.endpoint, ctx.base)? {
            for point in extract_injection_points(&seed) {
                let request = ctx.session.apply(mutate_request(&seed, &point, &self.marker));
                let response = ctx.engine.send_request(&request).await?;

                if response.body.contains(&self.marker) {
                    return Ok(vec![Observation::probe(
                        Severity::High,
                        Some(ctx.endpoint.reference()),
                        "Reflected XSS",
                        format!(
                            "{} {} reflects the marker unescaped via {}",
                            seed.method, ctx.endpoint.path, point
                        ),
                    )
                    .with_url(request.url.as_str())]);
                }
                debug!("XSS marker not reflected by {} ({})", ctx.endpoint.path, point);
            }
        }
        Ok(Vec::new())
    }
}
