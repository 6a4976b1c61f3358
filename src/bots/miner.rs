//! Resource extraction agent.
//!
//! The miner idles until a bill of materials arrives, then mines columns
//! along its search strategy, converting mined columns into materials, and
//! publishes inventory reports: periodically while mining and immediately
//! once the requirements are covered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::agent::{Agent, Behavior, CycleContext, CycleError, CycleStep, ParamMap};
use crate::bus::message::{topic, Message, Payload};
use crate::bus::{HandlerError, MessageBus};
use crate::locks::{Sector, SectorLockManager};
use crate::schematic::Bom;
use crate::search::{strategy_for, SearchStrategy};
use crate::settings::Settings;
use crate::terrain::TerrainOracle;

/// Validated bus input for the miner.
#[derive(Debug)]
pub enum MinerEvent {
    Requirements(Bom),
}

#[derive(Debug, PartialEq, Eq)]
pub enum MinerAction {
    Idle,
    Mine,
    ReportComplete,
}

/// Deterministic material yield for a mined column.
fn yield_material(x: i32, _z: i32) -> &'static str {
    if x.rem_euclid(7) == 0 {
        "iron"
    } else if x.rem_euclid(2) == 0 {
        "stone"
    } else {
        "wood"
    }
}

pub struct MinerState {
    id: String,
    bus: Arc<MessageBus>,
    terrain: Arc<dyn TerrainOracle>,
    locks: Arc<SectorLockManager>,
    inbox: mpsc::UnboundedReceiver<MinerEvent>,
    inventory: Bom,
    bom: Option<Bom>,
    strategy_name: String,
    strategy: Option<Box<dyn SearchStrategy>>,
    targets: VecDeque<(i32, i32)>,
    mine_origin: (i32, i32),
    mine_radius: i32,
    mine_y: i32,
    last_publish: Instant,
    publish_every: Duration,
    lock_timeout: Duration,
    mine_delay: Duration,
    idle_backoff: Duration,
}

impl MinerState {
    fn fulfilled(&self) -> bool {
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
                MinerEvent::Requirements(bom) => {
                    info!(agent = %self.id, ?bom, "material requirements received");
                    self.bom = Some(bom);
                    // fresh mission, fresh sweep
                    self.strategy = None;
                    self.targets.clear();
                }
            }
        }
    }

    /// Pop the next column to mine, refilling from the strategy and
    /// re-arming an exhausted strategy with a wider sweep.
    async fn next_target(&mut self) -> (i32, i32) {
        loop {
            if let Some(target) = self.targets.pop_front() {
                return target;
            }
            if self.strategy.is_none() {
                self.strategy = Some(strategy_for(
                    &self.strategy_name,
                    self.mine_origin,
                    self.mine_radius,
                ));
            }
            match self.strategy.as_mut().unwrap().next_batch().await {
                Some(batch) => self.targets.extend(batch),
                None => {
                    // widen the sweep and start over rather than stalling
                    self.mine_radius += 4;
                    debug!(agent = %self.id, radius = self.mine_radius, "sweep exhausted, widening");
                    self.strategy = None;
                }
            }
        }
    }

    async fn publish_inventory(&mut self) {
        self.last_publish = Instant::now();
        let msg = Message::broadcast(&self.id, Payload::Inventory(self.inventory.clone()));
        self.bus.publish(topic::INVENTORY, msg).await;
    }

    /// Mine one column under its sector lock. A contended sector is skipped,
    /// not waited on past the timeout.
    async fn mine_one(&mut self) -> Result<(), CycleError> {
        let (x, z) = self.next_target().await;
        let sector = Sector::containing(x, z);
        if !self.locks.acquire(sector, self.lock_timeout).await {
            debug!(agent = %self.id, %sector, "sector contended, skipping column");
            return Ok(());
        }
        let result = self.terrain.set_block(x, self.mine_y, z, "air").await;
        self.locks.release(sector).await;
        result?;

        let material = yield_material(x, z);
        *self.inventory.entry(material.to_string()).or_insert(0) += 1;
        if !self.mine_delay.is_zero() {
            tokio::time::sleep(self.mine_delay).await;
        }

        if self.fulfilled() || self.last_publish.elapsed() >= self.publish_every {
            self.publish_inventory().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Behavior for MinerState {
    type Percept = ();
    type Decision = MinerAction;

    async fn perceive(&mut self, _cx: &CycleContext) -> Result<(), CycleError> {
        self.drain_inbox();
        Ok(())
    }

    async fn decide(&mut self, _percept: (), _cx: &CycleContext) -> Result<MinerAction, CycleError> {
        Ok(if self.bom.is_none() {
            MinerAction::Idle
        } else if self.fulfilled() {
            MinerAction::ReportComplete
        } else {
            MinerAction::Mine
        })
    }

    async fn act(&mut self, action: MinerAction, cx: &CycleContext) -> Result<CycleStep, CycleError> {
        match action {
            MinerAction::Idle => {
                cx.mark_waiting("awaiting material requirements");
                tokio::time::sleep(self.idle_backoff).await;
                Ok(CycleStep::Continue)
            }
            MinerAction::Mine => {
                cx.mark_running("mining");
                self.mine_one().await?;
                Ok(CycleStep::Continue)
            }
            MinerAction::ReportComplete => {
                info!(agent = %self.id, inventory = ?self.inventory, "requirements fulfilled");
                self.publish_inventory().await;
                // mission served; go back to waiting for the next request
                self.bom = None;
                Ok(CycleStep::Continue)
            }
        }
    }

    async fn update(&mut self, params: ParamMap) {
        if let Some(name) = params.get("strategy").and_then(|v| v.as_str()) {
            info!(agent = %self.id, strategy = name, "mining strategy changed");
            self.strategy_name = name.to_string();
            self.strategy = None;
            self.targets.clear();
        }
        if let Some(y) = params.get("depth").and_then(|v| v.as_i64()) {
            self.mine_y = y as i32;
        }
    }

    async fn shutdown(&mut self) {
        // never strand a sector lock on abnormal exit
        self.locks.release_all().await;
    }

    async fn save_checkpoint(&mut self) {
        info!(agent = %self.id, inventory = ?self.inventory, "miner checkpoint");
    }
}

/// A miner agent ready to register and start.
pub type MinerBot = Agent<MinerState>;

pub fn create_miner(
    id: &str,
    bus: &Arc<MessageBus>,
    terrain: Arc<dyn TerrainOracle>,
    locks: Arc<SectorLockManager>,
    mine_origin: (i32, i32),
    settings: &Settings,
) -> MinerBot {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = MinerState {
        id: id.to_string(),
        bus: Arc::clone(bus),
        terrain,
        locks,
        inbox: rx,
        inventory: Bom::new(),
        bom: None,
        strategy_name: "spiral".to_string(),
        strategy: None,
        targets: VecDeque::new(),
        mine_origin,
        mine_radius: 8,
        mine_y: 10,
        last_publish: Instant::now(),
        publish_every: settings.inventory_publish(),
        lock_timeout: settings.lock_timeout(),
        mine_delay: settings.mine_delay(),
        idle_backoff: settings.idle_backoff(),
    };
    let agent = Agent::new(id, state, settings);

    {
        let agent_id = id.to_string();
        bus.subscribe(
            topic::MATERIAL_REQUIREMENTS,
            &format!("{id}/requirements"),
            move |msg: Message| {
                let tx = tx.clone();
                let agent_id = agent_id.clone();
                async move {
                    if !msg.target.includes(&agent_id) {
                        return Ok(());
                    }
                    match msg.payload {
                        Payload::MaterialRequirements(bom) => {
                            let _ = tx.send(MinerEvent::Requirements(bom));
                            Ok(())
                        }
                        other => Err(HandlerError::Validation(format!(
                            "expected material requirements, got {}",
                            other.kind()
                        ))),
                    }
                }
            },
        );
    }
    agent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use crate::terrain::SimulatedTerrain;
    use std::sync::Mutex;
    use tokio::time::{sleep, timeout};

    #[test]
    fn test_yield_material_is_deterministic() {
        assert_eq!(yield_material(0, 0), "iron");
        assert_eq!(yield_material(7, 0), "iron");
        assert_eq!(yield_material(-7, 3), "iron");
        assert_eq!(yield_material(2, 0), "stone");
        assert_eq!(yield_material(-4, 1), "stone");
        assert_eq!(yield_material(1, 0), "wood");
        assert_eq!(yield_material(3, 9), "wood");
    }

    #[tokio::test]
    async fn test_miner_waits_until_requirements_arrive() {
        let bus = Arc::new(MessageBus::new());
        let terrain = Arc::new(SimulatedTerrain::new(64));
        let locks = Arc::new(SectorLockManager::new());
        let agent = create_miner("miner-1", &bus, terrain.clone(), locks, (0, 0), &Settings::fast());
        agent.start().await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.state(), AgentState::Waiting);
        assert_eq!(terrain.mutation_count(), 0);
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_miner_fulfills_requirements_and_reports() {
        let bus = Arc::new(MessageBus::new());
        let terrain = Arc::new(SimulatedTerrain::new(64));
        let locks = Arc::new(SectorLockManager::new());
        let inventories = Arc::new(Mutex::new(Vec::new()));
        {
            let inventories = Arc::clone(&inventories);
            bus.subscribe(topic::INVENTORY, "test", move |msg| {
                let inventories = Arc::clone(&inventories);
                async move {
                    if let Payload::Inventory(bom) = msg.payload {
                        inventories.lock().unwrap().push(bom);
                    }
                    Ok(())
                }
            });
        }
        let agent = create_miner(
            "miner-1",
            &bus,
            terrain.clone(),
            Arc::clone(&locks),
            (0, 0),
            &Settings::fast(),
        );
        agent.start().await;

        bus.publish(
            topic::MATERIAL_REQUIREMENTS,
            Message::broadcast(
                "builder-1",
                Payload::MaterialRequirements(Bom::from([
                    ("stone".to_string(), 4),
                    ("wood".to_string(), 3),
                ])),
            ),
        )
        .await;

        let satisfied = timeout(Duration::from_secs(3), async {
            loop {
                {
                    let inventories = inventories.lock().unwrap();
                    if let Some(last) = inventories.last() {
                        if last.get("stone").copied().unwrap_or(0) >= 4
                            && last.get("wood").copied().unwrap_or(0) >= 3
                        {
                            break;
                        }
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(satisfied.is_ok(), "miner never covered the requirements");
        assert!(terrain.mutation_count() > 0);

        agent.stop().await;
        assert_eq!(locks.held_count().await, 0);
    }

    #[tokio::test]
    async fn test_strategy_update_resets_sweep() {
        let bus = Arc::new(MessageBus::new());
        let terrain = Arc::new(SimulatedTerrain::new(64));
        let locks = Arc::new(SectorLockManager::new());
        let agent = create_miner("miner-1", &bus, terrain, locks, (0, 0), &Settings::fast());
        agent
            .update(ParamMap::from([(
                "strategy".to_string(),
                serde_json::json!("line"),
            )]))
            .await;
        let behavior = agent.behavior().lock().await;
        assert_eq!(behavior.strategy_name, "line");
        assert!(behavior.strategy.is_none());
        assert!(behavior.targets.is_empty());
    }
}
