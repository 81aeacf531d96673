// ---------------------------------------------------------------------------
// Shared fixtures: a scripted model that records how it was called.
// ---------------------------------------------------------------------------
//
// Prompt grammar understood by `Scripted`:
//   "<name>"          answer immediately
//   "<name> <ms>"     block the calling thread for <ms> milliseconds
//   "fail ..."        return an error
// ---------------------------------------------------------------------------

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use hearth_engine::gate::{GateConfig, RequestGate};
use hearth_engine::models::{
    GenerationControl, GenerationOutput, GenerationParams, ModelHandle, ModelInfo, ModelParams,
    TextGenerator,
};
use hearth_engine::request::FinishReason;
use hearth_resilience::{HealthMonitor, HealthPolicy};

#[derive(Default)]
pub struct Probe {
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    order: Mutex<Vec<String>>,
}

impl Probe {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

pub struct Scripted {
    probe: Arc<Probe>,
}

impl TextGenerator for Scripted {
    fn generate(
        &mut self,
        prompt: &str,
        _params: &GenerationParams,
        _control: &GenerationControl,
    ) -> anyhow::Result<GenerationOutput> {
        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak.fetch_max(now, Ordering::SeqCst);
        self.probe.calls.fetch_add(1, Ordering::SeqCst);

        let mut words = prompt.split_whitespace();
        let name = words.next().unwrap_or_default().to_string();
        if let Some(ms) = words.next().and_then(|w| w.parse::<u64>().ok()) {
            thread::sleep(Duration::from_millis(ms));
        }

        self.probe.order.lock().unwrap().push(name.clone());
        self.probe.active.fetch_sub(1, Ordering::SeqCst);

        if name == "fail" {
            anyhow::bail!("scripted failure");
        }
        Ok(GenerationOutput {
            text: format!("done {name}"),
            prompt_tokens: 4,
            completion_tokens: 2,
            finish_reason: FinishReason::Stop,
        })
    }
}

pub fn scripted_model() -> (ModelHandle, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let handle = ModelHandle::from_generator(
        ModelInfo {
            name: "scripted".into(),
            path: PathBuf::from("scripted.gguf"),
            params: ModelParams {
                context_length: 512,
                threads: 1,
            },
        },
        Box::new(Scripted {
            probe: Arc::clone(&probe),
        }),
    );
    (handle, probe)
}

pub struct Harness {
    pub gate: Arc<RequestGate>,
    pub health: Arc<HealthMonitor>,
    pub probe: Arc<Probe>,
}

/// A ready gate over the scripted model.
pub fn harness(config: GateConfig, policy: HealthPolicy) -> Harness {
    let (handle, probe) = scripted_model();
    let health = Arc::new(HealthMonitor::new(policy));
    let gate = Arc::new(RequestGate::start(handle, Arc::clone(&health), config).unwrap());
    assert!(health.mark_ready());
    Harness {
        gate,
        health,
        probe,
    }
}

pub fn gate_config(capacity: usize) -> GateConfig {
    GateConfig {
        queue_capacity: capacity,
        default_timeout: Duration::from_secs(10),
        max_timeout: Duration::from_secs(30),
        ..GateConfig::default()
    }
}

/// Poll until the inference slot is occupied.
pub async fn wait_until_busy(gate: &RequestGate) {
    while !gate.serializer().is_busy() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Poll until `depth` requests are waiting.
pub async fn wait_for_depth(gate: &RequestGate, depth: usize) {
    while gate.serializer().queue_depth() < depth {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
