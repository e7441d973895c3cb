//! Common utilities for runtime integration tests

#![allow(dead_code)]

use std::sync::Arc;

use pmrt_api::sim::SimulatedHost;
use pmrt_runtime::{Runtime, RuntimeConfig};
use spin::Mutex;

/// Runtime on a fresh simulated host
pub fn runtime() -> (Arc<SimulatedHost>, Runtime) {
    runtime_with(RuntimeConfig::default())
}

pub fn runtime_with(config: RuntimeConfig) -> (Arc<SimulatedHost>, Runtime) {
    let host = Arc::new(SimulatedHost::new());
    let runtime = runtime_on(&host, config);
    (host, runtime)
}

/// Runtime on a host the test configured beforehand
pub fn runtime_on(host: &Arc<SimulatedHost>, config: RuntimeConfig) -> Runtime {
    Runtime::new(host.clone(), config).expect("runtime start-up")
}

/// Shared event log written from threads and handlers
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<u32>>>);

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: u32) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<u32> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }
}
