//! Construction agent.
//!
//! The builder waits for a map report, loads its schematic, publishes the
//! bill of materials, waits until the miner's inventory reports cover it,
//! then builds layer by layer under sector locks. Bus subscribers only
//! validate and forward into an inbox channel; all state changes happen
//! inside the builder's own cycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::{Agent, Behavior, CycleContext, CycleError, CycleStep, ParamMap};
use crate::bus::message::{topic, BuildStatus, MapReport, Message, Payload};
use crate::bus::{HandlerError, MessageBus};
use crate::locks::{Sector, SectorLockManager};
use crate::schematic::{Bom, BuildPlan, SchematicSource};
use crate::search::rectangle::FlatRectangle;
use crate::settings::Settings;
use crate::terrain::TerrainOracle;

/// Validated bus input, forwarded by subscribers into the builder's inbox.
#[derive(Debug)]
pub enum BuilderEvent {
    Map(MapReport),
    Inventory(Bom),
}

/// What one builder cycle decided to do, in priority order.
#[derive(Debug, PartialEq, Eq)]
pub enum BuilderAction {
    AnnounceReady,
    WaitForMap,
    ComputeBom,
    WaitForMaterials,
    BuildLayer,
    FinishBuilding,
}

pub struct BuilderState {
    id: String,
    bus: Arc<MessageBus>,
    terrain: Arc<dyn TerrainOracle>,
    templates: Arc<dyn SchematicSource>,
    locks: Arc<SectorLockManager>,
    inbox: mpsc::UnboundedReceiver<BuilderEvent>,
    template_name: String,
    site: Option<FlatRectangle>,
    bom: Option<Bom>,
    inventory: Bom,
    plan: Option<BuildPlan>,
    progress: u32,
    announced: bool,
    lock_timeout: Duration,
    block_delay: Duration,
    idle_backoff: Duration,
}

impl BuilderState {
    fn materials_ready(&self) -> bool {
        match &self.bom {
            Some(bom) => bom
                .iter()
                .all(|(material, required)| self.inventory.get(material).copied().unwrap_or(0) >= *required),
            None => false,
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(event) = self.inbox.try_recv() {
            match event {
                BuilderEvent::Map(report) => {
                    if self.site.is_some() {
                        debug!(agent = %self.id, "site already chosen, ignoring map report");
                        continue;
                    }
                    match report.rectangle {
                        Some(rect) => {
                            info!(agent = %self.id, area = rect.area, elevation = rect.elevation, "site candidate received");
                            self.site = Some(rect);
                        }
                        None => debug!(agent = %self.id, "map report without a flat area"),
                    }
                }
                BuilderEvent::Inventory(inventory) => {
                    debug!(agent = %self.id, ?inventory, "inventory update");
                    self.inventory = inventory;
                }
            }
        }
    }

    fn choose_action(&self) -> BuilderAction {
        if !self.announced {
            return BuilderAction::AnnounceReady;
        }
        if self.site.is_none() {
            return BuilderAction::WaitForMap;
        }
        if self.bom.is_none() {
            return BuilderAction::ComputeBom;
        }
        let total = self.plan.as_ref().map(|p| p.len() as u32);
        if let Some(total) = total {
            if self.progress >= total {
                return BuilderAction::FinishBuilding;
            }
        }
        if !self.materials_ready() {
            return BuilderAction::WaitForMaterials;
        }
        BuilderAction::BuildLayer
    }

    async fn publish(&self, topic: &str, payload: Payload) {
        let msg = Message::broadcast(&self.id, payload);
        self.bus.publish(topic, msg).await;
    }

    /// Load the schematic, verify it fits the site, publish the bill of
    /// materials. An undersized site is discarded so a later map report can
    /// supply a better one.
    async fn compute_bom(&mut self) -> Result<(), CycleError> {
        let site = self.site.expect("compute_bom requires a site");
        let schematic = self.templates.load(&self.template_name)?;
        let (width, depth) = schematic.footprint();
        if !site.fits(width, depth) {
            warn!(
                agent = %self.id,
                site_area = site.area,
                needed = format!("{width}x{depth}"),
                "site too small for schematic, awaiting a better map"
            );
            self.site = None;
            return Ok(());
        }
        let bom = schematic.material_totals();
        let origin = (site.x1, site.elevation + 1, site.z1);
        self.plan = Some(schematic.build_plan(origin));
        info!(agent = %self.id, ?bom, ?origin, "build plan ready, requesting materials");
        self.publish(
            topic::MATERIAL_REQUIREMENTS,
            Payload::MaterialRequirements(bom.clone()),
        )
        .await;
        self.bom = Some(bom);
        Ok(())
    }

    /// Place one layer of blocks under the locks of every sector the layer
    /// touches. If any lock cannot be acquired the partial set is released
    /// and the layer retries next cycle.
    async fn build_layer(&mut self) -> Result<(), CycleError> {
        let layer = {
            let plan = self.plan.as_ref().expect("build_layer requires a plan");
            plan.layers[self.progress as usize].clone()
        };
        let mut sectors: Vec<Sector> = layer
            .blocks
            .iter()
            .map(|b| Sector::containing(b.x, b.z))
            .collect();
        sectors.sort_by_key(|s| (s.x, s.z));
        sectors.dedup();

        let mut acquired = Vec::with_capacity(sectors.len());
        for sector in &sectors {
            if self.locks.acquire(*sector, self.lock_timeout).await {
                acquired.push(*sector);
            } else {
                warn!(agent = %self.id, %sector, "sector lock contended, retrying layer");
                for held in acquired {
                    self.locks.release(held).await;
                }
                tokio::time::sleep(self.idle_backoff).await;
                return Ok(());
            }
        }

        for block in &layer.blocks {
            self.terrain
                .set_block(block.x, block.y, block.z, &block.material)
                .await?;
            if !self.block_delay.is_zero() {
                tokio::time::sleep(self.block_delay).await;
            }
        }
        for sector in acquired {
            self.locks.release(sector).await;
        }

        self.progress += 1;
        let total = self.plan.as_ref().map(|p| p.len() as u32).unwrap_or(0);
        info!(agent = %self.id, progress = self.progress, total, "layer placed");
        self.publish(
            topic::BUILD,
            Payload::Build {
                status: BuildStatus::LayerDone,
                progress: self.progress,
                total,
            },
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl Behavior for BuilderState {
    type Percept = ();
    type Decision = BuilderAction;

    async fn perceive(&mut self, _cx: &CycleContext) -> Result<(), CycleError> {
        self.drain_inbox();
        Ok(())
    }

    async fn decide(
        &mut self,
        _percept: (),
        _cx: &CycleContext,
    ) -> Result<BuilderAction, CycleError> {
        Ok(self.choose_action())
    }

    async fn act(
        &mut self,
        action: BuilderAction,
        cx: &CycleContext,
    ) -> Result<CycleStep, CycleError> {
        match action {
            BuilderAction::AnnounceReady => {
                self.announced = true;
                self.publish(topic::BUILDER_STATUS, Payload::BuilderStatus { ready: true })
                    .await;
                Ok(CycleStep::Continue)
            }
            BuilderAction::WaitForMap => {
                cx.mark_waiting("awaiting map report");
                tokio::time::sleep(self.idle_backoff).await;
                Ok(CycleStep::Continue)
            }
            BuilderAction::ComputeBom => {
                cx.mark_running("map report received");
                self.compute_bom().await?;
                Ok(CycleStep::Continue)
            }
            BuilderAction::WaitForMaterials => {
                cx.mark_waiting("awaiting materials");
                tokio::time::sleep(self.idle_backoff).await;
                Ok(CycleStep::Continue)
            }
            BuilderAction::BuildLayer => {
                cx.mark_running("materials available");
                self.build_layer().await?;
                Ok(CycleStep::Continue)
            }
            BuilderAction::FinishBuilding => {
                let total = self.plan.as_ref().map(|p| p.len() as u32).unwrap_or(0);
                info!(agent = %self.id, layers = total, "structure complete");
                self.publish(
                    topic::BUILD,
                    Payload::Build {
                        status: BuildStatus::Completed,
                        progress: self.progress,
                        total,
                    },
                )
                .await;
                Ok(CycleStep::Finished)
            }
        }
    }

    async fn update(&mut self, params: ParamMap) {
        if let Some(name) = params.get("template").and_then(|v| v.as_str()) {
            info!(agent = %self.id, template = name, "template set");
            self.template_name = name.to_string();
            // An in-flight build restarts from scratch: the next cycle
            // recomputes the plan against the kept site and republishes the
            // bill of materials for the new template.
            if self.bom.is_some() || self.plan.is_some() {
                info!(agent = %self.id, "replanning for new template");
                self.bom = None;
                self.plan = None;
                self.progress = 0;
            }
        }
    }

    async fn shutdown(&mut self) {
        // shutdown sweep so an aborted build never strands sector locks
        self.locks.release_all().await;
    }

    async fn save_checkpoint(&mut self) {
        info!(
            agent = %self.id,
            progress = self.progress,
            total = self.plan.as_ref().map(|p| p.len()).unwrap_or(0),
            "builder checkpoint"
        );
    }
}

/// A builder agent ready to register and start.
pub type BuilderBot = Agent<BuilderState>;

pub fn create_builder(
    id: &str,
    bus: &Arc<MessageBus>,
    terrain: Arc<dyn TerrainOracle>,
    templates: Arc<dyn SchematicSource>,
    locks: Arc<SectorLockManager>,
    template_name: &str,
    settings: &Settings,
) -> BuilderBot {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = BuilderState {
        id: id.to_string(),
        bus: Arc::clone(bus),
        terrain,
        templates,
        locks,
        inbox: rx,
        template_name: template_name.to_string(),
        site: None,
        bom: None,
        inventory: Bom::new(),
        plan: None,
        progress: 0,
        announced: false,
        lock_timeout: settings.lock_timeout(),
        block_delay: settings.block_delay(),
        idle_backoff: settings.idle_backoff(),
    };
    let agent = Agent::new(id, state, settings);

    // Subscribers validate shape and addressing, then forward to the inbox.
    // They never touch builder state directly.
    {
        let tx = tx.clone();
        let agent_id = id.to_string();
        bus.subscribe(topic::MAP, &format!("{id}/map"), move |msg: Message| {
            let tx = tx.clone();
            let agent_id = agent_id.clone();
            async move {
                if !msg.target.includes(&agent_id) {
                    return Ok(());
                }
                match msg.payload {
                    Payload::Map(report) => {
                        let _ = tx.send(BuilderEvent::Map(report));
                        Ok(())
                    }
                    other => Err(HandlerError::Validation(format!(
                        "expected map payload, got {}",
                        other.kind()
                    ))),
                }
            }
        });
    }
    {
        let agent_id = id.to_string();
        bus.subscribe(
            topic::INVENTORY,
            &format!("{id}/inventory"),
            move |msg: Message| {
                let tx = tx.clone();
                let agent_id = agent_id.clone();
                async move {
                    if !msg.target.includes(&agent_id) {
                        return Ok(());
                    }
                    match msg.payload {
                        Payload::Inventory(inventory) => {
                            let _ = tx.send(BuilderEvent::Inventory(inventory));
                            Ok(())
                        }
                        other => Err(HandlerError::Validation(format!(
                            "expected inventory payload, got {}",
                            other.kind()
                        ))),
                    }
                }
            },
        );
    }
    agent
}
