//! Message envelope and payload shapes.
//!
//! Every message on the bus carries the same envelope: a unique id, the
//! sender, an addressing target, a typed payload, and a timestamp. Payloads
//! are an adjacently tagged enum so the wire form stays self-describing and
//! a subscriber can reject the wrong shape before touching its own state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::agent::ParamMap;
use crate::schematic::Bom;
use crate::search::rectangle::FlatRectangle;

/// Well-known topic names. Versioned so a future payload change can run a
/// v2 topic alongside v1 during migration.
pub mod topic {
    pub const MAP: &str = "map.v1";
    pub const MATERIAL_REQUIREMENTS: &str = "materials.requirements.v1";
    pub const INVENTORY: &str = "inventory.v1";
    pub const BUILD: &str = "build.v1";
    pub const BUILDER_STATUS: &str = "builder.status.v1";
    /// Receives every publication regardless of topic.
    pub const WILDCARD: &str = "*";

    /// Audit topic for a command applied to an agent.
    pub fn command(agent: &str, verb: &str) -> String {
        format!("command.{agent}.{verb}.v1")
    }
}

/// Message addressing: a single named agent or everyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    Agent(String),
    Broadcast,
}

impl Target {
    /// Whether an agent with this id should process the message.
    pub fn includes(&self, agent_id: &str) -> bool {
        match self {
            Target::Agent(id) => id == agent_id,
            Target::Broadcast => true,
        }
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        if s == "*" {
            Target::Broadcast
        } else {
            Target::Agent(s)
        }
    }
}

impl From<Target> for String {
    fn from(t: Target) -> Self {
        match t {
            Target::Agent(id) => id,
            Target::Broadcast => "*".to_string(),
        }
    }
}

/// Result of a terrain scan: the best flat rectangle found (if any) plus
/// enough context to judge the scan's coverage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapReport {
    pub rectangle: Option<FlatRectangle>,
    pub samples: usize,
    pub center: (i32, i32),
    pub radius: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    LayerDone,
    Completed,
}

/// Typed message body, adjacently tagged as `{"kind": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Map(MapReport),
    MaterialRequirements(Bom),
    Inventory(Bom),
    Build {
        status: BuildStatus,
        progress: u32,
        total: u32,
    },
    BuilderStatus {
        ready: bool,
    },
    Command(ParamMap),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Map(_) => "map",
            Payload::MaterialRequirements(_) => "material_requirements",
            Payload::Inventory(_) => "inventory",
            Payload::Build { .. } => "build",
            Payload::BuilderStatus { .. } => "builder_status",
            Payload::Command(_) => "command",
        }
    }
}

/// The envelope every publication travels in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub source: String,
    pub target: Target,
    pub payload: Payload,
    /// Free-form correlation data, opaque to the bus.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(source: impl Into<String>, target: Target, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            target,
            payload,
            context: None,
            timestamp: Utc::now(),
        }
    }

    pub fn broadcast(source: impl Into<String>, payload: Payload) -> Self {
        Self::new(source, Target::Broadcast, payload)
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_addressing() {
        assert!(Target::Broadcast.includes("anyone"));
        assert!(Target::Agent("builder-1".into()).includes("builder-1"));
        assert!(!Target::Agent("builder-1".into()).includes("miner-1"));
    }

    #[test]
    fn test_target_serde_round_trip() {
        let json = serde_json::to_string(&Target::Broadcast).unwrap();
        assert_eq!(json, "\"*\"");
        let back: Target = serde_json::from_str("\"explorer-1\"").unwrap();
        assert_eq!(back, Target::Agent("explorer-1".into()));
    }

    #[test]
    fn test_payload_wire_shape() {
        let msg = Message::broadcast(
            "builder-1",
            Payload::Build {
                status: BuildStatus::LayerDone,
                progress: 2,
                total: 6,
            },
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"]["kind"], "build");
        assert_eq!(value["payload"]["data"]["status"], "LAYER_DONE");
        assert_eq!(value["payload"]["data"]["progress"], 2);
        assert_eq!(value["target"], "*");
        assert!(value.get("context").is_none());
    }

    #[test]
    fn test_command_topic_format() {
        assert_eq!(topic::command("miner-1", "set"), "command.miner-1.set.v1");
    }
}
