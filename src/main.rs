use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use taskmesh::engine::{
    BenchmarkRunner, Engine, EngineConfig, SimulatedExecutor, TaskEvent, TaskKind, TaskOptions, TaskPriority,
};
use taskmesh::metrics::start_metrics_server;
use taskmesh::node::{LoopbackTransport, Peer, PeerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::from_yaml("config.yaml").unwrap_or_else(|err| {
        eprintln!("⚠️ Failed to load config.yaml: {}. Using defaults.", err);
        EngineConfig::default()
    });

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.get_logging_level()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("🚀 Starting taskmesh demo");

    if config.metrics_enabled {
        if let Err(e) = start_metrics_server(config.metrics_port) {
            warn!(error = %e, "metrics exporter not started");
        }
    }

    // One in-process peer that can take GPU work off our hands
    let executor = Arc::new(SimulatedExecutor::with_scale(0.5));
    let registry = Arc::new(PeerRegistry::new());
    let transport = Arc::new(LoopbackTransport::new(executor.clone()));
    registry.upsert(Peer::new(
        "peer-gpu-1",
        [TaskKind::GpuCompute, TaskKind::AiInference],
        Duration::from_millis(5),
    ));

    let engine = Engine::with_peers(config, executor, registry, transport);

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                TaskEvent::Started(exec) => {
                    let info = exec.task.kind().info();
                    info!(task = %exec.id(), "{} {} started", info.icon, info.label);
                }
                TaskEvent::Completed(exec) => {
                    info!(task = %exec.id(), status = ?exec.status, "task settled");
                }
                TaskEvent::Queued(_) => {}
            }
        }
    });

    println!("📋 Running benchmark battery...");
    println!("{}", "=".repeat(50));

    let report = engine.benchmark_runner().run(&BenchmarkRunner::standard_set()).await;
    for result in &report.results {
        match &result.outcome {
            Ok(elapsed) => println!("✅ {:<16} {:<16} {:>6} ms", result.name, result.kind, elapsed.as_millis()),
            Err(e) => println!("❌ {:<16} {:<16} {} ({})", result.name, result.kind, e, e.kind()),
        }
    }
    println!(
        "📊 {} passed, {} failed in {} ms",
        report.passed(),
        report.failed(),
        report.total.as_millis()
    );

    // A burst of distributed work, plus one task we give up on
    let mut handles = Vec::new();
    for i in 0..6 {
        let options = TaskOptions::default()
            .with_priority(TaskPriority::High)
            .distributed();
        handles.push(engine.submit_task(TaskKind::Compute, json!({ "batch": i }), options)?);
    }
    let doomed = engine.submit_named(
        "crypto",
        json!({ "op": "sha256", "rounds": 1_000_000 }),
        TaskOptions::default().with_priority(TaskPriority::Low),
    )?;
    if engine.cancel_task(doomed.id()).await {
        println!("❌ Low-priority crypto task cancelled");
    }

    for handle in handles {
        match handle.wait().await {
            Ok(output) => println!("✅ {} finished on {}", output.task_id, output.binding),
            Err(e) => println!("⚠️ task failed: {}", e),
        }
    }

    println!("\n=== Final Statistics ===");
    let stats = engine.get_stats().await;
    println!(
        "👷 {} workers, load {:.2}, {} completed, {} failed, avg {} ms",
        stats.total_workers,
        stats.current_load,
        stats.tasks_completed,
        stats.tasks_failed,
        stats.average_task_time.as_millis()
    );
    for row in &stats.per_kind {
        println!(
            "  {} {:<16} workers={} busy={} done={} avg={} ms",
            row.kind.info().icon,
            row.label,
            row.workers,
            row.busy,
            row.tasks_completed,
            row.average_task_time.as_millis()
        );
    }

    engine.shutdown().await;
    println!("✅ Demo completed");
    Ok(())
}
