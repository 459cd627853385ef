//! # Resilience Flow Scenario
//!
//! Drives the full fault path end to end against an in-memory backend:
//! fault deduplication, circuit breaker tripping, escalation to critical
//! and the orchestrator's automatic restart.

use std::sync::Arc;
use std::time::Duration;

use lib_watch::channel::transport::MemoryTransport;
use lib_watch::config::{ChannelConfig, OrchestratorConfig, RecoveryPolicy, ResilienceConfig};
use lib_watch::{CoreConfig, Fault, FaultKind, Orchestrator, Severity, SystemStatus};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = CoreConfig {
        channel: ChannelConfig {
            auto_connect: false,
            auto_reconnect: false,
            ..Default::default()
        },
        resilience: ResilienceConfig {
            breaker_threshold: 3,
            channel_reconnect: RecoveryPolicy {
                cooldown_ms: 0,
                max_attempts: 100,
            },
            ..Default::default()
        },
        orchestrator: OrchestratorConfig {
            restart_delay_ms: 200,
            ..Default::default()
        },
        ..Default::default()
    };

    // No backend peer: every reconnect attempt will fail.
    let (transport, peers) = MemoryTransport::new();
    drop(peers);

    let orchestrator = Orchestrator::new(cfg, Arc::new(transport));
    orchestrator.start().await?;

    println!("[*] Injecting duplicate parsing faults...");
    let faults = orchestrator.fault_sender();
    for _ in 0..4 {
        faults.send(Fault::new(
            FaultKind::ParsingError,
            Severity::Low,
            "health",
            "malformed status payload",
        ))?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reports = orchestrator.engine().error_reports();
    if reports.len() != 1 || reports[0].occurrences != 4 {
        eprintln!("[ERROR] Expected one report with 4 occurrences, got {:?}", reports);
        std::process::exit(1);
    }
    println!("[OK] 4 identical faults collapsed into one report.");

    println!("[*] Injecting connection faults until the breaker trips...");
    for i in 0..2 {
        faults.send(Fault::new(
            FaultKind::ConnectionError,
            Severity::Medium,
            "channel",
            format!("socket closed by peer ({})", i),
        ))?;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let restarts = orchestrator.restart_count();
    if restarts != 1 {
        eprintln!("[ERROR] Expected exactly one automatic restart, got {}", restarts);
        std::process::exit(1);
    }
    if orchestrator.status() == SystemStatus::Error {
        eprintln!("[ERROR] Core still in error state after restart.");
        std::process::exit(1);
    }
    println!("[OK] Breaker opened, condition escalated, core restarted once.");

    orchestrator.stop().await;
    println!("\n[SUCCESS] Resilience flow behaved as expected.");
    Ok(())
}
