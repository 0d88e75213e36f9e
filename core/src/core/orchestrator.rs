/// Phased scan run: spider, active scan, probes, aggregation.
///
/// One `PhaseOrchestrator` drives exactly one run against one target. Phases
/// run strictly in sequence; the only suspension points are the polling waits
/// (routed through a `Clock`) and the engine calls themselves. Probes inside
/// the Probing phase run on a bounded pool, but their observations are merged
/// in plan order by a single consumer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::core::catalog::EndpointCatalog;
use crate::core::clock::{Clock, TokioClock};
use crate::core::result_aggregator::{Report, ResultAggregator};
use crate::core::session::{begin_session, Session};
use crate::core::{EndpointRef, Observation, ObservationSource, Severity};
use crate::engine::{EngineAlert, ScanEngine, ScanHandle, ScanPhase};
use crate::error::{Result, RunFailure, ScanError};
use crate::probes::{ProbeContext, ProbeKind, ProbeSuite};
use crate::{NullSink, ScanConfig, SinkRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunState {
    Idle,
    Spidering,
    ActiveScanning,
    Probing,
    Aggregating,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Spidering => "spidering",
            RunState::ActiveScanning => "active scanning",
            RunState::Probing => "probing",
            RunState::Aggregating => "aggregating",
            RunState::Done => "done",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation, shared between the run and whoever may stop it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub report: Report,
    /// The engine's own report, when one was requested and could be fetched.
    pub engine_report: Option<Vec<u8>>,
    pub transitions: Vec<RunState>,
}

pub struct PhaseOrchestrator {
    engine: Arc<dyn ScanEngine>,
    clock: Arc<dyn Clock>,
    sink: SinkRef,
    cancel: CancelFlag,
    config: ScanConfig,
    target: Url,
    catalog: EndpointCatalog,
    suite: ProbeSuite,
    state: RunState,
    transitions: Vec<RunState>,
    handles_seen: HashSet<(ScanPhase, String)>,
}

impl PhaseOrchestrator {
    /// Validates `config` and prepares a run. Nothing is sent to the engine yet.
    pub fn new(engine: Arc<dyn ScanEngine>, config: ScanConfig) -> Result<Self> {
        config.validate()?;
        let target = config.target_url()?;
        let catalog = EndpointCatalog::from_endpoints(config.endpoints.clone())?;
        let suite = ProbeSuite::standard(&config.probes, &config.enabled_probes);

        Ok(Self {
            engine,
            clock: Arc::new(TokioClock::new()),
            sink: Arc::new(NullSink),
            cancel: CancelFlag::new(),
            config,
            target,
            catalog,
            suite,
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
            handles_seen: HashSet::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: SinkRef) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_suite(mut self, suite: ProbeSuite) -> Self {
        self.suite = suite;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn transitions(&self) -> &[RunState] {
        &self.transitions
    }

    pub fn catalog(&self) -> &EndpointCatalog {
        &self.catalog
    }

    /// The probe matrix this run will execute, in execution order.
    pub fn plan(&self) -> Vec<(EndpointRef, ProbeKind)> {
        self.suite
            .plan(&self.catalog)
            .iter()
            .map(|p| (p.endpoint.reference(), p.probe.kind()))
            .collect()
    }

    /// Runs every phase. Either a report comes back or the state the run
    /// failed in plus the reason; a run is never silently empty.
    pub async fn run(&mut self) -> std::result::Result<RunOutcome, RunFailure> {
        if self.state != RunState::Idle {
            return Err(RunFailure {
                phase: self.state,
                error: ScanError::InvalidConfig("a run can only be started once".to_string()),
            });
        }

        match self.execute().await {
            Ok((report, engine_report)) => {
                self.enter(RunState::Done);
                Ok(RunOutcome {
                    report,
                    engine_report,
                    transitions: self.transitions.clone(),
                })
            }
            Err(error) => {
                let phase = self.state;
                let terminal = if matches!(error, ScanError::Cancelled { .. }) {
                    RunState::Cancelled
                } else {
                    RunState::Failed
                };
                self.sink.on_log("error", &format!("[!] Run {} while {}: {}", terminal, phase, error));
                self.enter(terminal);
                Err(RunFailure { phase, error })
            }
        }
    }

    async fn execute(&mut self) -> Result<(Report, Option<Vec<u8>>)> {
        let mut aggregator = ResultAggregator::new(self.target.as_str(), &self.catalog);

        self.enter(RunState::Spidering);
        self.check_cancel()?;
        if let Err(e) = self.engine.access_url(&self.target).await {
            warn!("Engine could not pre-fetch {}: {}", self.target, e);
        }
        let spider = self.engine.start_spider(&self.target).await?;
        self.track(&spider)?;
        self.await_completion(spider).await?;
        if self.config.drain_passive {
            self.drain_passive_queue().await?;
        }
        let passive = self.engine.list_alerts(&self.target).await?;
        let passive = self.alerts_to_observations(passive, ObservationSource::PassiveAlert);
        self.collect(&mut aggregator, "passive-alerts", passive);

        self.enter(RunState::ActiveScanning);
        self.check_cancel()?;
        if self.config.skip_active {
            info!("Active scan skipped by configuration");
            self.sink.on_log("warn", "[~] Active scan skipped");
        } else {
            let active = self.engine.start_active_scan(&self.target).await?;
            self.track(&active)?;
            self.await_completion(active).await?;
            let alerts = self.engine.list_alerts(&self.target).await?;
            let alerts = self.alerts_to_observations(alerts, ObservationSource::ActiveAlert);
            self.collect(&mut aggregator, "active-alerts", alerts);
        }

        self.enter(RunState::Probing);
        self.check_cancel()?;
        let session = self.establish_session(&mut aggregator).await?;
        self.run_probes(&session, &mut aggregator).await?;

        self.enter(RunState::Aggregating);
        self.check_cancel()?;
        // Alerts raised by the passive scanner while probes were running.
        let late = self.engine.list_alerts(&self.target).await?;
        let late = self.alerts_to_observations(late, ObservationSource::PassiveAlert);
        self.collect(&mut aggregator, "late-alerts", late);

        aggregator.hosts(self.engine.list_hosts().await?);

        let engine_report = if self.config.engine_report.is_some() {
            match self.engine.render_report().await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Engine report unavailable: {}", e);
                    self.sink.on_log("warn", &format!("[!] Engine report unavailable: {}", e));
                    None
                }
            }
        } else {
            None
        };

        let report = aggregator.build();
        info!(
            "Run against {} produced {} observation(s) across {} host(s)",
            self.target,
            report.observations.len(),
            report.hosts_scanned.len()
        );
        Ok((report, engine_report))
    }

    fn enter(&mut self, state: RunState) {
        debug!("Run state {} -> {}", self.state, state);
        self.state = state;
        self.transitions.push(state);
        self.sink.on_state(state);
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ScanError::Cancelled {
                phase: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Handle ids must be unique within a run.
    fn track(&mut self, handle: &ScanHandle) -> Result<()> {
        if !self.handles_seen.insert((handle.phase, handle.id.clone())) {
            return Err(ScanError::engine(
                format!("start {}", handle.phase),
                format!("scan id {} was already used in this run", handle.id),
            ));
        }
        Ok(())
    }

    /// Polls `handle` until it reports 100, the phase times out, or the run is
    /// cancelled. The handle is consumed either way; on timeout, cancellation,
    /// or a failed poll the engine is told to stop the scan first.
    async fn await_completion(&self, handle: ScanHandle) -> Result<()> {
        let phase = handle.phase.to_string();
        let interval = Duration::from_secs(self.config.poll_interval);
        let timeout = Duration::from_secs(self.config.phase_timeout);
        let started = self.clock.elapsed();
        let mut polls = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                self.abandon(&handle).await;
                return Err(ScanError::Cancelled { phase });
            }

            let status = match self.engine.poll_status(&handle).await {
                Ok(status) => status,
                Err(e) => {
                    self.abandon(&handle).await;
                    return Err(e);
                }
            };
            polls += 1;
            self.sink.on_progress(&phase, usize::from(status.min(100)), 100);

            if status >= 100 {
                debug!("{} {} complete after {} poll(s)", phase, handle.id, polls);
                return Ok(());
            }

            let waited = self.clock.elapsed().saturating_sub(started);
            if waited >= timeout {
                warn!("{} {} still at {}% after {:?}", phase, handle.id, status, waited);
                self.abandon(&handle).await;
                return Err(ScanError::PhaseTimeout { phase, waited });
            }
            self.clock.sleep(interval.min(timeout - waited)).await;
        }
    }

    async fn abandon(&self, handle: &ScanHandle) {
        if let Err(e) = self.engine.stop_scan(handle).await {
            warn!("Could not stop {} {}: {}", handle.phase, handle.id, e);
        }
    }

    /// Waits for the passive scanner to work through what the spider found.
    async fn drain_passive_queue(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.poll_interval);
        let timeout = Duration::from_secs(self.config.phase_timeout);
        let started = self.clock.elapsed();

        loop {
            self.check_cancel()?;
            let remaining = self.engine.passive_queue_len().await?;
            if remaining == 0 {
                return Ok(());
            }
            debug!("Passive scanner has {} record(s) left", remaining);

            let waited = self.clock.elapsed().saturating_sub(started);
            if waited >= timeout {
                return Err(ScanError::PhaseTimeout {
                    phase: "passive scan".to_string(),
                    waited,
                });
            }
            self.clock.sleep(interval.min(timeout - waited)).await;
        }
    }

    /// A login that fails at the engine downgrades the run to an
    /// unauthenticated session and is recorded as an Info observation.
    async fn establish_session(&self, aggregator: &mut ResultAggregator) -> Result<Session> {
        if !self.config.session.is_configured() {
            return Ok(Session::unauthenticated());
        }
        match begin_session(self.engine.as_ref(), &self.target, &self.config.session).await {
            Ok(session) => {
                if !session.is_authenticated() {
                    self.sink.on_log("warn", "[!] Login produced no credentials, probing unauthenticated");
                }
                Ok(session)
            }
            Err(e) if e.is_engine_failure() => {
                warn!("Could not begin authenticated session: {}", e);
                let note = Observation::probe(
                    Severity::Info,
                    None,
                    "Authenticated session unavailable",
                    format!("login failed, probes ran unauthenticated: {}", e),
                );
                self.collect(aggregator, "session", vec![note]);
                Ok(Session::unauthenticated())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_probes(&self, session: &Session, aggregator: &mut ResultAggregator) -> Result<()> {
        let plan = self.suite.plan(&self.catalog);
        let total = plan.len();
        info!("Running {} probe(s) across {} endpoint(s)", total, self.catalog.len());

        let engine: &dyn ScanEngine = self.engine.as_ref();
        let base = &self.target;
        let cancel = &self.cancel;

        let mut results = stream::iter(plan.into_iter().enumerate())
            .map(|(index, planned)| async move {
                if cancel.is_cancelled() {
                    return None;
                }
                let ctx = ProbeContext {
                    endpoint: planned.endpoint,
                    session,
                    engine,
                    base,
                };
                let kind = planned.probe.kind();
                let observations = match planned.probe.run(&ctx).await {
                    Ok(observations) => observations,
                    Err(e) => {
                        warn!("{} probe failed on {}: {}", kind, planned.endpoint.path, e);
                        vec![Observation::probe(
                            Severity::Info,
                            Some(planned.endpoint.reference()),
                            format!("{} probe failed", kind),
                            e.to_string(),
                        )]
                    }
                };
                Some((format!("probe-{}", index), observations))
            })
            .buffered(self.config.threads.max(1));

        // In-flight probes are always awaited, even after a cancel.
        let mut done = 0;
        let mut cancelled = false;
        while let Some(result) = results.next().await {
            match result {
                Some((batch, observations)) if !cancelled => {
                    self.collect(aggregator, &batch, observations);
                    done += 1;
                    self.sink.on_progress("probing", done, total);
                }
                Some(_) => {}
                None => cancelled = true,
            }
            if self.cancel.is_cancelled() {
                cancelled = true;
            }
        }

        if cancelled {
            return Err(ScanError::Cancelled {
                phase: RunState::Probing.to_string(),
            });
        }
        Ok(())
    }

    fn alerts_to_observations(&self, alerts: Vec<EngineAlert>, source: ObservationSource) -> Vec<Observation> {
        alerts
            .into_iter()
            .map(|alert| {
                let endpoint = self.endpoint_for(&alert);
                alert.into_observation(source, endpoint)
            })
            .collect()
    }

    /// Catalog entry an alert URL falls under, relative to the target base path.
    fn endpoint_for(&self, alert: &EngineAlert) -> Option<EndpointRef> {
        let path = alert.path()?;
        let prefix = self.target.path().trim_end_matches('/');
        let relative = path.strip_prefix(prefix).unwrap_or(&path);
        let relative = if relative.is_empty() { "/" } else { relative };
        self.catalog.find_by_path(relative).map(|e| e.reference())
    }

    fn collect(&self, aggregator: &mut ResultAggregator, batch: &str, observations: Vec<Observation>) {
        let before = aggregator.len();
        aggregator.add(batch, observations);
        for obs in &aggregator.observations()[before..] {
            self.sink.on_observation(obs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(RunState::ActiveScanning.to_string(), "active scanning");
        assert!(RunState::Cancelled.is_terminal());
        assert!(!RunState::Probing.is_terminal());
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        other.cancel();
        assert!(flag.is_cancelled());
    }
}
