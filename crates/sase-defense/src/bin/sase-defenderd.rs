//! OpenSASE Real-Time Defense - Main Entry Point
//!
//! Reads threat events as JSON lines on stdin and writes one JSON decision
//! per line to stdout.

use anyhow::Context;
use sase_defense::{Alert, DefenseConfig, DefenseCoordinator, HttpRouter, PatternWorkflows, ThreatEvent};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("OpenSASE Defense v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path = std::env::var("CONFIG_PATH")
        .unwrap_or_else(|_| "/etc/opensase/defense.json".into());

    let config = DefenseConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Config {} not usable ({}), using defaults", config_path, e);
        DefenseConfig::default()
    });

    let router = Arc::new(HttpRouter::new(&config.router));
    let coordinator = Arc::new(
        DefenseCoordinator::new(config, router).context("invalid defense configuration")?,
    );
    let _sweeper = coordinator.spawn_cache_sweeper();

    coordinator.alerts().register_listener(Arc::new(|alert: &Alert| {
        tracing::warn!(alert_id = %alert.id, priority = ?alert.priority, "{}", alert.message);
    }));

    let workflows = PatternWorkflows::new(Arc::clone(&coordinator));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            continue;
        }

        let threat: ThreatEvent = match serde_json::from_str(&line) {
            Ok(threat) => threat,
            Err(e) => {
                tracing::warn!("Skipping malformed threat event: {}", e);
                continue;
            }
        };

        let output = match workflows.defend(&threat).await {
            Ok(response) => json!({ "threat_id": threat.id, "response": response }),
            Err(e) => json!({ "threat_id": threat.id, "error": e.to_string() }),
        };

        let mut encoded = serde_json::to_vec(&output)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }

    let status = coordinator.status();
    tracing::info!("Input closed; final status: {}", serde_json::to_string(&status)?);

    Ok(())
}
