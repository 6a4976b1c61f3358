//! Demo mission: scout a plateau, mine the materials, build a house.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blockswarm::bus::message::{topic, BuildStatus, Payload};
use blockswarm::bots::{create_builder, create_explorer, create_miner};
use blockswarm::command::AgentRegistry;
use blockswarm::locks::SectorLockManager;
use blockswarm::schematic::TemplateLibrary;
use blockswarm::settings::Settings;
use blockswarm::terrain::SimulatedTerrain;
use blockswarm::MessageBus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::load_or_default(".blockswarm/settings.json");
    let bus = Arc::new(MessageBus::new());
    let locks = Arc::new(SectorLockManager::new());
    let terrain = Arc::new(SimulatedTerrain::new(64).with_plateau(-8, -8, 8, 8, 70));
    let templates: Arc<TemplateLibrary> = Arc::new(match &settings.template_dir {
        Some(dir) => TemplateLibrary::with_dir(dir),
        None => TemplateLibrary::new(),
    });

    // every message crosses the audit tap
    bus.subscribe(topic::WILDCARD, "audit", |msg| async move {
        info!(
            id = %msg.id,
            source = %msg.source,
            kind = msg.payload.kind(),
            "bus traffic"
        );
        Ok(())
    });

    // completion watch, fed from the bus
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    bus.subscribe(topic::BUILD, "mission-watch", move |msg| {
        let done_tx = done_tx.clone();
        async move {
            if let Payload::Build {
                status: BuildStatus::Completed,
                ..
            } = msg.payload
            {
                let _ = done_tx.send(());
            }
            Ok(())
        }
    });

    let registry = AgentRegistry::new(Arc::clone(&bus));
    let explorer = create_explorer("explorer-1", &bus, terrain.clone(), &settings);
    let builder = create_builder(
        "builder-1",
        &bus,
        terrain.clone(),
        templates,
        Arc::clone(&locks),
        "house_small",
        &settings,
    );
    let miner = create_miner(
        "miner-1",
        &bus,
        terrain.clone(),
        Arc::clone(&locks),
        (40, 40),
        &settings,
    );
    registry.register(Arc::new(explorer));
    registry.register(Arc::new(builder));
    registry.register(Arc::new(miner));

    // scripted mission, issued exactly as an operator would type it
    let script = [
        "/explorer-1 set x=0 z=0 range=8 strategy=spiral",
        "/explorer-1 start",
        "/builder-1 start",
        "/miner-1 start",
        "/list",
    ];
    for line in script {
        let outcome = registry
            .dispatch_line(line)
            .await
            .with_context(|| format!("command failed: {line}"))?;
        info!(command = line, ?outcome, "command applied");
    }

    match tokio::time::timeout(Duration::from_secs(60), done_rx.recv()).await {
        Ok(Some(())) => info!("mission complete"),
        _ => warn!("mission did not complete within the deadline"),
    }

    for agent in ["explorer-1", "builder-1", "miner-1"] {
        let _ = registry.dispatch_line(&format!("/{agent} stop")).await;
    }
    locks.release_all().await;
    info!(mutations = terrain.mutation_count(), "world summary");
    Ok(())
}
