// tests/common/mod.rs
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use taskmesh::engine::{
    CancelSignal, Engine, EngineConfig, ExecutionStatus, Executor, ExecutorError, Task, WorkerSpec,
};
use taskmesh::node::{LoopbackTransport, Peer, PeerRegistry};
use uuid::Uuid;

/// Executor driven by payload directives:
/// `sleep_ms` (cancellable delay), `fail` (error message), `hang` (wait for
/// cancel), `ignore_cancel` (never return), `panic`.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    started: Mutex<Vec<Uuid>>,
    markers: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<Uuid> {
        self.started.lock().unwrap().clone()
    }

    /// `marker` fields of started payloads, in start order.
    pub fn markers(&self) -> Vec<String> {
        self.markers.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, task: &Task, mut cancel: CancelSignal) -> Result<Value, ExecutorError> {
        let payload = task.payload();
        self.started.lock().unwrap().push(task.id());
        if let Some(marker) = payload.get("marker").and_then(Value::as_str) {
            self.markers.lock().unwrap().push(marker.to_string());
        }

        if payload.get("panic").and_then(Value::as_bool).unwrap_or(false) {
            panic!("scripted panic");
        }

        if payload.get("ignore_cancel").and_then(Value::as_bool).unwrap_or(false) {
            std::future::pending::<()>().await;
        }

        if payload.get("hang").and_then(Value::as_bool).unwrap_or(false) {
            cancel.cancelled().await;
            return Err(ExecutorError::new("stopped on request"));
        }

        if let Some(ms) = payload.get("sleep_ms").and_then(Value::as_u64) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = cancel.cancelled() => return Err(ExecutorError::new("stopped on request")),
            }
        }

        if let Some(message) = payload.get("fail").and_then(Value::as_str) {
            return Err(ExecutorError::new(message));
        }

        Ok(json!({ "echo": payload }))
    }
}

pub fn test_config(pool: Vec<WorkerSpec>) -> EngineConfig {
    let mut config = EngineConfig::with_pool(pool);
    config.tick_ms = 20;
    config
}

pub fn local_engine(pool: Vec<WorkerSpec>) -> (Engine, Arc<ScriptedExecutor>) {
    let executor = ScriptedExecutor::new();
    let engine = Engine::new(test_config(pool), executor.clone());
    (engine, executor)
}

pub struct PeeredEngine {
    pub engine: Engine,
    pub executor: Arc<ScriptedExecutor>,
    pub registry: Arc<PeerRegistry>,
    pub transport: Arc<LoopbackTransport>,
}

/// Engine whose peers run on a loopback transport sharing the scripted executor.
pub fn peered_engine(pool: Vec<WorkerSpec>, peers: Vec<Peer>) -> PeeredEngine {
    let executor = ScriptedExecutor::new();
    let registry = Arc::new(PeerRegistry::new());
    for peer in peers {
        registry.upsert(peer);
    }
    let transport = Arc::new(LoopbackTransport::new(executor.clone()));
    let engine = Engine::with_peers(
        test_config(pool),
        executor.clone(),
        Arc::clone(&registry),
        transport.clone(),
    );
    PeeredEngine {
        engine,
        executor,
        registry,
        transport,
    }
}

/// Poll until the execution reaches `status` or `within` runs out.
pub async fn wait_for_status(engine: &Engine, id: Uuid, status: ExecutionStatus, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if engine.execution(id).await.map(|e| e.status) == Some(status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
