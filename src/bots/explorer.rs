//! Terrain scout.
//!
//! The explorer takes scan requests through `update` (center, range,
//! strategy), samples column heights along the chosen search strategy, runs
//! flat-area detection over the samples, and broadcasts the result as a map
//! report. A request that arrives while a scan is underway is queued and
//! served on the next cycle; once no request remains the agent finishes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::agent::{Agent, Behavior, CycleContext, CycleError, CycleStep, ParamMap};
use crate::bus::message::{topic, MapReport, Message, Payload};
use crate::bus::MessageBus;
use crate::search::rectangle::best_flat_rectangle;
use crate::search::strategy_for;
use crate::settings::Settings;
use crate::terrain::TerrainOracle;

#[derive(Debug, Clone)]
struct ScanRequest {
    center: (i32, i32),
    radius: i32,
    strategy: String,
}

impl ScanRequest {
    fn from_params(params: &ParamMap) -> Self {
        let int = |key: &str, default: i64| {
            params
                .get(key)
                .and_then(|v| v.as_i64())
                .unwrap_or(default)
        };
        let strategy = params
            .get("strategy")
            .and_then(|v| v.as_str())
            .unwrap_or("spiral")
            .to_string();
        Self {
            center: (int("x", 0) as i32, int("z", 0) as i32),
            radius: int("range", 8).max(0) as i32,
            strategy,
        }
    }
}

/// Behavior state of an explorer agent.
pub struct ExplorerState {
    id: String,
    bus: Arc<MessageBus>,
    terrain: Arc<dyn TerrainOracle>,
    pending: Option<ScanRequest>,
    scan_delay: Duration,
    scans_completed: u64,
}

impl ExplorerState {
    pub fn new(
        id: impl Into<String>,
        bus: Arc<MessageBus>,
        terrain: Arc<dyn TerrainOracle>,
        settings: &Settings,
    ) -> Self {
        Self {
            id: id.into(),
            bus,
            terrain,
            pending: None,
            scan_delay: settings.scan_delay(),
            scans_completed: 0,
        }
    }
}

/// One fully sampled scan, ready for detection.
pub struct ScanSamples {
    request: ScanRequest,
    heights: HashMap<(i32, i32), i32>,
}

/// What the explorer decided to do with a scan.
pub enum ExplorerAction {
    Publish(MapReport),
    Done,
}

#[async_trait]
impl Behavior for ExplorerState {
    type Percept = Option<ScanSamples>;
    type Decision = ExplorerAction;

    /// Drain the pending request by sampling terrain heights along the
    /// configured strategy, checking cancellation between batches.
    async fn perceive(&mut self, cx: &CycleContext) -> Result<Self::Percept, CycleError> {
        let Some(request) = self.pending.take() else {
            return Ok(None);
        };
        info!(
            agent = %self.id,
            center = ?request.center,
            radius = request.radius,
            strategy = %request.strategy,
            "scan started"
        );
        let mut strategy = strategy_for(&request.strategy, request.center, request.radius);
        let mut heights = HashMap::new();
        while let Some(batch) = strategy.next_batch().await {
            if cx.is_cancelled() {
                debug!(agent = %self.id, "scan cancelled mid-batch");
                return Ok(None);
            }
            for (x, z) in batch {
                let h = self.terrain.height(x, z).await?;
                heights.insert((x, z), h);
            }
            if !self.scan_delay.is_zero() {
                tokio::time::sleep(self.scan_delay).await;
            }
        }
        Ok(Some(ScanSamples { request, heights }))
    }

    async fn decide(
        &mut self,
        percept: Self::Percept,
        _cx: &CycleContext,
    ) -> Result<Self::Decision, CycleError> {
        let Some(samples) = percept else {
            return Ok(ExplorerAction::Done);
        };
        let rectangle = best_flat_rectangle(&samples.heights);
        if rectangle.is_none() {
            warn!(agent = %self.id, samples = samples.heights.len(), "no flat area found");
        }
        Ok(ExplorerAction::Publish(MapReport {
            rectangle,
            samples: samples.heights.len(),
            center: samples.request.center,
            radius: samples.request.radius,
        }))
    }

    async fn act(
        &mut self,
        decision: Self::Decision,
        _cx: &CycleContext,
    ) -> Result<CycleStep, CycleError> {
        match decision {
            ExplorerAction::Publish(report) => {
                self.scans_completed += 1;
                info!(
                    agent = %self.id,
                    samples = report.samples,
                    found = report.rectangle.is_some(),
                    "publishing map report"
                );
                let msg = Message::broadcast(&self.id, Payload::Map(report))
                    .with_context(serde_json::json!({ "scan": self.scans_completed }));
                self.bus.publish(topic::MAP, msg).await;
                // Always run one more cycle: a request queued while this
                // scan held the behavior lock lands between cycles, and the
                // next perceive either serves it or winds down via Done.
                Ok(CycleStep::Continue)
            }
            ExplorerAction::Done => Ok(CycleStep::Finished),
        }
    }

    async fn update(&mut self, params: ParamMap) {
        let request = ScanRequest::from_params(&params);
        info!(agent = %self.id, center = ?request.center, radius = request.radius, "scan queued");
        self.pending = Some(request);
    }

    async fn save_checkpoint(&mut self) {
        info!(agent = %self.id, scans = self.scans_completed, "explorer checkpoint");
    }
}

/// An explorer agent ready to register and start.
pub type ExplorerBot = Agent<ExplorerState>;

pub fn create_explorer(
    id: &str,
    bus: &Arc<MessageBus>,
    terrain: Arc<dyn TerrainOracle>,
    settings: &Settings,
) -> ExplorerBot {
    let state = ExplorerState::new(id, Arc::clone(bus), terrain, settings);
    Agent::new(id, state, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use crate::terrain::SimulatedTerrain;
    use std::sync::Mutex;
    use tokio::time::{sleep, timeout};

    fn plateau_terrain() -> Arc<SimulatedTerrain> {
        Arc::new(SimulatedTerrain::new(60).with_plateau(-4, -4, 4, 4, 70))
    }

    #[tokio::test]
    async fn test_scan_publishes_map_report_and_finishes() {
        let bus = Arc::new(MessageBus::new());
        let reports = Arc::new(Mutex::new(Vec::new()));
        {
            let reports = Arc::clone(&reports);
            bus.subscribe(topic::MAP, "test", move |msg| {
                let reports = Arc::clone(&reports);
                async move {
                    if let Payload::Map(report) = msg.payload {
                        reports.lock().unwrap().push(report);
                    }
                    Ok(())
                }
            });
        }
        let agent = create_explorer("explorer-1", &bus, plateau_terrain(), &Settings::fast());
        agent
            .update(ParamMap::from([
                ("x".into(), serde_json::json!(0)),
                ("z".into(), serde_json::json!(0)),
                ("range".into(), serde_json::json!(4)),
                ("strategy".into(), serde_json::json!("spiral")),
            ]))
            .await;
        agent.start().await;

        let deadline = timeout(Duration::from_secs(2), async {
            while agent.state() != AgentState::Stopped {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(deadline.is_ok(), "explorer did not finish in time");

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        let rect = reports[0].rectangle.expect("plateau should be detected");
        assert_eq!(rect.elevation, 70);
        assert_eq!(rect.area, 81); // the full 9x9 plateau
        assert_eq!(reports[0].samples, 81);
    }

    #[tokio::test]
    async fn test_request_queued_mid_scan_is_served() {
        let bus = Arc::new(MessageBus::new());
        let reports = Arc::new(Mutex::new(Vec::new()));
        {
            let reports = Arc::clone(&reports);
            bus.subscribe(topic::MAP, "test", move |msg| {
                let reports = Arc::clone(&reports);
                async move {
                    if let Payload::Map(report) = msg.payload {
                        reports.lock().unwrap().push(report);
                    }
                    Ok(())
                }
            });
        }
        let mut settings = Settings::fast();
        settings.scan_delay_ms = 10; // slow the scan so the second request lands mid-flight
        let agent = create_explorer("explorer-1", &bus, plateau_terrain(), &settings);
        agent
            .update(ParamMap::from([
                ("x".into(), serde_json::json!(0)),
                ("range".into(), serde_json::json!(4)),
            ]))
            .await;
        agent.start().await;
        sleep(Duration::from_millis(15)).await;
        assert_ne!(agent.state(), AgentState::Stopped, "first scan already over");
        // queued while the first scan holds the behavior lock
        agent
            .update(ParamMap::from([
                ("x".into(), serde_json::json!(30)),
                ("range".into(), serde_json::json!(2)),
            ]))
            .await;

        let deadline = timeout(Duration::from_secs(2), async {
            while agent.state() != AgentState::Stopped {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(deadline.is_ok(), "explorer did not finish in time");

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2, "queued request was not served");
        assert_eq!(reports[0].center, (0, 0));
        assert_eq!(reports[1].center, (30, 0));
    }

    #[tokio::test]
    async fn test_no_request_finishes_immediately() {
        let bus = Arc::new(MessageBus::new());
        let agent = create_explorer("explorer-1", &bus, plateau_terrain(), &Settings::fast());
        agent.start().await;
        sleep(Duration::from_millis(50)).await;
        assert_eq!(agent.state(), AgentState::Stopped);
    }

    #[test]
    fn test_request_parsing_defaults() {
        let req = ScanRequest::from_params(&ParamMap::new());
        assert_eq!(req.center, (0, 0));
        assert_eq!(req.radius, 8);
        assert_eq!(req.strategy, "spiral");
        let req = ScanRequest::from_params(&ParamMap::from([
            ("x".into(), serde_json::json!(-12)),
            ("range".into(), serde_json::json!(-5)),
            ("strategy".into(), serde_json::json!("line")),
        ]));
        assert_eq!(req.center, (-12, 0));
        assert_eq!(req.radius, 0); // negative range clamps
        assert_eq!(req.strategy, "line");
    }
}
