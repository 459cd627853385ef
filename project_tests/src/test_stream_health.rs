//! # Stream & Health Scenario
//!
//! Feeds tracking and status envelopes through an in-memory backend and
//! checks frame ordering, drop accounting, sync quality and the derived
//! health alerts.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use lib_watch::channel::transport::MemoryTransport;
use lib_watch::channel::{Envelope, EnvelopeKind};
use lib_watch::config::ChannelConfig;
use lib_watch::{CoreConfig, Orchestrator, SystemStatus};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = CoreConfig {
        channel: ChannelConfig {
            auto_connect: true,
            ..Default::default()
        },
        ..Default::default()
    };
    let (transport, mut peers) = MemoryTransport::new();
    let orchestrator = Orchestrator::new(cfg, Arc::new(transport));
    orchestrator.start().await?;
    let peer = peers.recv().await.expect("backend peer");

    println!("[*] Sending tracking updates (with one duplicate frame)...");
    for index in [1u64, 2, 3, 3, 4] {
        peer.to_client.send(Envelope::with_payload(
            EnvelopeKind::TrackingUpdate,
            json!({"source": "cam-01", "frameIndex": index, "boxes": []}),
        ))?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sync = orchestrator.sync();
    let latest = sync.current_frame("cam-01").map(|f| f.index);
    let drops = sync.drop_counts().get("cam-01").copied().unwrap_or(0);
    if latest != Some(4) || drops != 1 {
        eprintln!(
            "[ERROR] Expected latest frame 4 with 1 drop, got {:?} / {}",
            latest, drops
        );
        std::process::exit(1);
    }
    let quality = sync.sync_quality();
    if quality <= 0.7 || quality >= 0.9 {
        eprintln!("[ERROR] Sync quality out of expected band: {}", quality);
        std::process::exit(1);
    }
    println!("[OK] Ordering enforced, drop counted, quality {:.3}.", quality);

    println!("[*] Sending a degraded status snapshot...");
    peer.to_client.send(Envelope::with_payload(
        EnvelopeKind::StatusUpdate,
        json!({
            "metrics": {"fps": 15.0, "latency": 250.0, "cpuUsage": 50.0},
            "services": {"tracker": "healthy", "recorder": {"status": "down"}}
        }),
    ))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let health = orchestrator.health();
    let open = health.unresolved_alerts();
    let ids: Vec<_> = open.iter().map(|a| a.id.as_str()).collect();
    if !ids.contains(&"fps_low") || !ids.contains(&"latency_high") {
        eprintln!("[ERROR] Expected fps_low and latency_high alerts, got {:?}", ids);
        std::process::exit(1);
    }
    println!("[OK] Threshold alerts raised: {:?}", ids);

    println!("[*] Sending a healthy snapshot to clear the alerts...");
    peer.to_client.send(Envelope::with_payload(
        EnvelopeKind::StatusUpdate,
        json!({"metrics": {"fps": 30.0, "latency": 40.0, "cpuUsage": 30.0}}),
    ))?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    if !health.unresolved_alerts().is_empty() {
        eprintln!("[ERROR] Alerts did not resolve on recovery.");
        std::process::exit(1);
    }
    if orchestrator.status() != SystemStatus::Active {
        eprintln!("[ERROR] Expected active status, got {:?}", orchestrator.status());
        std::process::exit(1);
    }
    println!("[OK] Alerts resolved exactly once; system active.");

    orchestrator.stop().await;
    println!("\n[SUCCESS] Stream and health pipeline behaved as expected.");
    Ok(())
}
