//! In-memory `ScanEngine` driven by a script, for exercising the orchestrator
//! and probes without a live engine.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use crate::engine::{EngineAlert, ScanEngine, ScanHandle, ScanPhase};
use crate::error::{Result, ScanError};
use crate::http::{ProbeRequest, ProbeResponse};

type Responder = Arc<dyn Fn(&ProbeRequest) -> ProbeResponse + Send + Sync>;

/// How a scripted call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Unreachable,
    Rejected,
}

impl Failure {
    fn into_error(self, operation: &str) -> ScanError {
        match self {
            Failure::Unreachable => ScanError::unreachable(operation, "connection refused"),
            Failure::Rejected => ScanError::engine(operation, "scripted rejection"),
        }
    }
}

#[derive(Default)]
struct Script {
    spider_statuses: VecDeque<u8>,
    ascan_statuses: VecDeque<u8>,
    passive_queue: VecDeque<u64>,
    spider_start_failure: Option<Failure>,
    ascan_start_failure: Option<Failure>,
    poll_failure: Option<Failure>,
    hosts_failure: Option<Failure>,
    report_failure: Option<Failure>,
    responders: HashMap<String, Responder>,
    failing_paths: HashMap<String, Failure>,
    probe_alerts: HashMap<String, Vec<EngineAlert>>,
    csrf_alerts: HashMap<String, Vec<EngineAlert>>,
    alerts: Vec<EngineAlert>,
    alerts_on_active: Vec<EngineAlert>,
    hosts: BTreeSet<String>,
    report: Vec<u8>,
}

#[derive(Default)]
struct Log {
    calls: Vec<String>,
    sent: Vec<ProbeRequest>,
    fuzzed: Vec<ProbeRequest>,
    next_id: u32,
    stopped: HashSet<String>,
}

/// Builder-style scripted engine. Status sequences repeat their last value
/// once exhausted; an empty sequence reads as 100.
#[derive(Default)]
pub struct ScriptedEngine {
    script: Mutex<Script>,
    log: Mutex<Log>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn edit(self, f: impl FnOnce(&mut Script)) -> Self {
        if let Ok(mut script) = self.script.lock() {
            f(&mut script);
        }
        self
    }

    pub fn spider_statuses(self, statuses: impl IntoIterator<Item = u8>) -> Self {
        let statuses: VecDeque<u8> = statuses.into_iter().collect();
        self.edit(|s| s.spider_statuses = statuses)
    }

    pub fn active_statuses(self, statuses: impl IntoIterator<Item = u8>) -> Self {
        let statuses: VecDeque<u8> = statuses.into_iter().collect();
        self.edit(|s| s.ascan_statuses = statuses)
    }

    pub fn passive_queue(self, lengths: impl IntoIterator<Item = u64>) -> Self {
        let lengths: VecDeque<u64> = lengths.into_iter().collect();
        self.edit(|s| s.passive_queue = lengths)
    }

    pub fn fail_spider_start(self, failure: Failure) -> Self {
        self.edit(|s| s.spider_start_failure = Some(failure))
    }

    pub fn fail_active_start(self, failure: Failure) -> Self {
        self.edit(|s| s.ascan_start_failure = Some(failure))
    }

    pub fn fail_polls(self, failure: Failure) -> Self {
        self.edit(|s| s.poll_failure = Some(failure))
    }

    pub fn fail_hosts(self, failure: Failure) -> Self {
        self.edit(|s| s.hosts_failure = Some(failure))
    }

    pub fn fail_report(self, failure: Failure) -> Self {
        self.edit(|s| s.report_failure = Some(failure))
    }

    /// Fixed response for requests to `path`.
    pub fn respond(self, path: &str, response: ProbeResponse) -> Self {
        self.respond_with(path, move |_| response.clone())
    }

    /// Computed response for requests to `path`.
    pub fn respond_with(
        self,
        path: &str,
        responder: impl Fn(&ProbeRequest) -> ProbeResponse + Send + Sync + 'static,
    ) -> Self {
        let path = path.to_string();
        self.edit(|s| {
            s.responders.insert(path, Arc::new(responder));
        })
    }

    /// Requests to `path` fail at the engine.
    pub fn fail_requests(self, path: &str, failure: Failure) -> Self {
        let path = path.to_string();
        self.edit(|s| {
            s.failing_paths.insert(path, failure);
        })
    }

    pub fn probe_alerts(self, path: &str, alerts: Vec<EngineAlert>) -> Self {
        let path = path.to_string();
        self.edit(|s| {
            s.probe_alerts.insert(path, alerts);
        })
    }

    pub fn csrf_alerts(self, path: &str, alerts: Vec<EngineAlert>) -> Self {
        let path = path.to_string();
        self.edit(|s| {
            s.csrf_alerts.insert(path, alerts);
        })
    }

    /// Alerts present from the start (raised by passive scanning).
    pub fn alerts(self, alerts: Vec<EngineAlert>) -> Self {
        self.edit(|s| s.alerts = alerts)
    }

    /// Alerts that appear once an active scan has been started.
    pub fn alerts_on_active(self, alerts: Vec<EngineAlert>) -> Self {
        self.edit(|s| s.alerts_on_active = alerts)
    }

    pub fn hosts<S: Into<String>>(self, hosts: impl IntoIterator<Item = S>) -> Self {
        let hosts: BTreeSet<String> = hosts.into_iter().map(Into::into).collect();
        self.edit(|s| s.hosts = hosts)
    }

    pub fn report(self, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        self.edit(|s| s.report = bytes)
    }

    fn record(&self, call: impl Into<String>) {
        if let Ok(mut log) = self.log.lock() {
            log.calls.push(call.into());
        }
    }

    /// Every call made so far, in order, e.g. `"spider.status 0"`.
    pub fn calls(&self) -> Vec<String> {
        self.log.lock().map(|l| l.calls.clone()).unwrap_or_default()
    }

    /// Number of calls whose name starts with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn sent_requests(&self) -> Vec<ProbeRequest> {
        self.log.lock().map(|l| l.sent.clone()).unwrap_or_default()
    }

    /// Requests handed to the engine's fuzzer.
    pub fn fuzzed_requests(&self) -> Vec<ProbeRequest> {
        self.log.lock().map(|l| l.fuzzed.clone()).unwrap_or_default()
    }

    pub fn was_stopped(&self, id: &str) -> bool {
        self.log.lock().map(|l| l.stopped.contains(id)).unwrap_or(false)
    }

    fn start(&self, phase: ScanPhase) -> ScanHandle {
        let id = match self.log.lock() {
            Ok(mut log) => {
                let id = log.next_id;
                log.next_id += 1;
                id
            }
            Err(_) => 0,
        };
        ScanHandle::new(phase, id.to_string())
    }
}

fn next_status<T: Copy>(queue: &mut VecDeque<T>, done: T) -> T {
    match queue.len() {
        0 => done,
        1 => queue[0],
        _ => queue.pop_front().unwrap_or(done),
    }
}

fn lock_err(operation: &str) -> ScanError {
    ScanError::engine(operation, "scripted engine lock poisoned")
}

#[async_trait]
impl ScanEngine for ScriptedEngine {
    async fn access_url(&self, url: &Url) -> Result<()> {
        self.record(format!("access {}", url.path()));
        Ok(())
    }

    async fn start_spider(&self, _target: &Url) -> Result<ScanHandle> {
        self.record("spider.start");
        let failure = self.script.lock().map_err(|_| lock_err("start spider"))?.spider_start_failure;
        if let Some(f) = failure {
            return Err(f.into_error("start spider"));
        }
        Ok(self.start(ScanPhase::Spider))
    }

    async fn start_active_scan(&self, _target: &Url) -> Result<ScanHandle> {
        self.record("ascan.start");
        let mut script = self.script.lock().map_err(|_| lock_err("start active scan"))?;
        if let Some(f) = script.ascan_start_failure {
            return Err(f.into_error("start active scan"));
        }
        let raised = std::mem::take(&mut script.alerts_on_active);
        script.alerts.extend(raised);
        drop(script);
        Ok(self.start(ScanPhase::ActiveScan))
    }

    async fn poll_status(&self, handle: &ScanHandle) -> Result<u8> {
        let name = match handle.phase {
            ScanPhase::Spider => "spider.status",
            ScanPhase::ActiveScan => "ascan.status",
        };
        self.record(format!("{} {}", name, handle.id));
        let mut script = self.script.lock().map_err(|_| lock_err(name))?;
        if let Some(f) = script.poll_failure {
            return Err(f.into_error(name));
        }
        let status = match handle.phase {
            ScanPhase::Spider => next_status(&mut script.spider_statuses, 100),
            ScanPhase::ActiveScan => next_status(&mut script.ascan_statuses, 100),
        };
        Ok(status.min(100))
    }

    async fn stop_scan(&self, handle: &ScanHandle) -> Result<()> {
        self.record(format!("stop {} {}", handle.phase, handle.id));
        if let Ok(mut log) = self.log.lock() {
            log.stopped.insert(handle.id.clone());
        }
        Ok(())
    }

    async fn passive_queue_len(&self) -> Result<u64> {
        self.record("pscan.queue");
        let mut script = self.script.lock().map_err(|_| lock_err("passive queue"))?;
        Ok(next_status(&mut script.passive_queue, 0))
    }

    async fn send_request(&self, request: &ProbeRequest) -> Result<ProbeResponse> {
        let path = request.url.path().to_string();
        self.record(format!("send {} {}", request.method, path));
        if let Ok(mut log) = self.log.lock() {
            log.sent.push(request.clone());
        }
        let (failure, responder) = {
            let script = self.script.lock().map_err(|_| lock_err("send request"))?;
            (script.failing_paths.get(&path).copied(), script.responders.get(&path).cloned())
        };
        if let Some(f) = failure {
            return Err(f.into_error("send request"));
        }
        Ok(match responder {
            Some(r) => r(request),
            None => ProbeResponse::new(404, "Not Found"),
        })
    }

    async fn run_probe(&self, request: &ProbeRequest) -> Result<Vec<EngineAlert>> {
        let path = request.url.path().to_string();
        self.record(format!(
            "fuzz {} {}{}",
            request.method,
            path,
            if request.body.is_empty() { "" } else { " +body" }
        ));
        if let Ok(mut log) = self.log.lock() {
            log.fuzzed.push(request.clone());
        }
        let script = self.script.lock().map_err(|_| lock_err("run probe"))?;
        if let Some(f) = script.failing_paths.get(&path) {
            return Err(f.into_error("run probe"));
        }
        Ok(script.probe_alerts.get(&path).cloned().unwrap_or_default())
    }

    async fn csrf_scan(&self, url: &Url) -> Result<Vec<EngineAlert>> {
        let path = url.path().to_string();
        self.record(format!("csrf {}", path));
        let script = self.script.lock().map_err(|_| lock_err("csrf scan"))?;
        if let Some(f) = script.failing_paths.get(&path) {
            return Err(f.into_error("csrf scan"));
        }
        Ok(script.csrf_alerts.get(&path).cloned().unwrap_or_default())
    }

    async fn list_hosts(&self) -> Result<BTreeSet<String>> {
        self.record("hosts");
        let script = self.script.lock().map_err(|_| lock_err("list hosts"))?;
        if let Some(f) = script.hosts_failure {
            return Err(f.into_error("list hosts"));
        }
        Ok(script.hosts.clone())
    }

    async fn list_alerts(&self, _base: &Url) -> Result<Vec<EngineAlert>> {
        self.record("alerts");
        let script = self.script.lock().map_err(|_| lock_err("list alerts"))?;
        Ok(script.alerts.clone())
    }

    async fn render_report(&self) -> Result<Vec<u8>> {
        self.record("report");
        let script = self.script.lock().map_err(|_| lock_err("render report"))?;
        if let Some(f) = script.report_failure {
            return Err(f.into_error("render report"));
        }
        Ok(script.report.clone())
    }
}
