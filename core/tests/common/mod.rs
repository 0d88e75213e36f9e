#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use zapflow_core::engine::testing::ScriptedEngine;
use zapflow_core::engine::EngineAlert;
use zapflow_core::http::ProbeResponse;
use zapflow_core::{
    CancelFlag, Endpoint, HttpMethod, ManualClock, Observation, PhaseOrchestrator, RunState, ScanConfig,
    ScanEventSink, Sensitivity,
};

pub const TARGET: &str = "http://localhost:5000";

/// The endpoints of the demo server application.
pub fn server_endpoints() -> Vec<Endpoint> {
    vec![
        Endpoint::new("/", Sensitivity::Public),
        Endpoint::new("/auth/google", Sensitivity::Public),
        Endpoint::new("/auth/google/callback", Sensitivity::Public),
        Endpoint::new("/auth/user", Sensitivity::AuthRequired),
        Endpoint::new("/auth/logout", Sensitivity::StateChanging),
        Endpoint::new("/api/items", Sensitivity::StateChanging)
            .with_methods([HttpMethod::Get, HttpMethod::Post])
            .with_params(["query"]),
        Endpoint::new("/api/social-media-posts", Sensitivity::StateChanging)
            .with_methods([HttpMethod::Get, HttpMethod::Post]),
        Endpoint::new("/api/social-media-data", Sensitivity::AuthRequired),
        Endpoint::new("/api/items/{id}", Sensitivity::ObjectReferencing),
    ]
}

pub fn config() -> ScanConfig {
    ScanConfig {
        target: TARGET.to_string(),
        poll_interval: 2,
        phase_timeout: 10,
        threads: 2,
        endpoints: server_endpoints(),
        drain_passive: false,
        ..Default::default()
    }
}

/// An engine where the target denies anonymous access to protected endpoints
/// and every scan completes on the first poll.
pub fn quiet_engine() -> ScriptedEngine {
    ScriptedEngine::new()
        .respond("/auth/user", ProbeResponse::new(401, "Unauthorized"))
        .respond("/api/social-media-data", ProbeResponse::new(401, "Unauthorized"))
        .respond("/api/items", ProbeResponse::new(200, "[]"))
        .hosts(["localhost"])
}

pub struct Harness {
    pub engine: Arc<ScriptedEngine>,
    pub clock: Arc<ManualClock>,
    pub orchestrator: PhaseOrchestrator,
}

pub fn harness(engine: ScriptedEngine, config: ScanConfig) -> Harness {
    let engine = Arc::new(engine);
    let clock = Arc::new(ManualClock::new());
    let orchestrator = PhaseOrchestrator::new(engine.clone(), config)
        .expect("valid config")
        .with_clock(clock.clone());
    Harness {
        engine,
        clock,
        orchestrator,
    }
}

pub fn alert(id: &str, risk: &str, path: &str) -> EngineAlert {
    EngineAlert {
        id: id.to_string(),
        plugin_id: "10000".to_string(),
        name: format!("Alert {}", id),
        risk: risk.to_string(),
        url: format!("{}{}", TARGET, path),
        param: String::new(),
        description: format!("engine alert {}", id),
    }
}

/// Records what the run reported.
#[derive(Default)]
pub struct RecordingSink {
    pub states: Mutex<Vec<RunState>>,
    pub observations: Mutex<Vec<Observation>>,
    pub progress: Mutex<Vec<(String, usize, usize)>>,
}

impl ScanEventSink for RecordingSink {
    fn on_log(&self, _level: &str, _message: &str) {}

    fn on_observation(&self, observation: &Observation) {
        self.observations.lock().unwrap().push(observation.clone());
    }

    fn on_progress(&self, phase: &str, current: usize, total: usize) {
        self.progress.lock().unwrap().push((phase.to_string(), current, total));
    }

    fn on_state(&self, state: RunState) {
        self.states.lock().unwrap().push(state);
    }
}

/// Cancels the run once `phase` reports at least `at` progress.
pub struct CancelAt {
    pub flag: CancelFlag,
    pub phase: &'static str,
    pub at: usize,
}

impl ScanEventSink for CancelAt {
    fn on_log(&self, _level: &str, _message: &str) {}
    fn on_observation(&self, _observation: &Observation) {}

    fn on_progress(&self, phase: &str, current: usize, _total: usize) {
        if phase == self.phase && current >= self.at {
            self.flag.cancel();
        }
    }

    fn on_state(&self, _state: RunState) {}
}
