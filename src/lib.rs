//! blockswarm: a cooperative multi-agent construction runtime.
//!
//! A swarm of agents shares one world: an explorer scouts terrain for flat
//! build sites, a miner extracts materials, and a builder assembles a
//! schematic layer by layer. Agents run independent perceive→decide→act
//! loops, coordinate through an in-process topic bus, and serialize world
//! mutations through per-sector locks. Operators drive the swarm with
//! chat-style commands resolved by an explicit agent registry.

pub mod agent;
pub mod bots;
pub mod bus;
pub mod command;
pub mod locks;
pub mod schematic;
pub mod search;
pub mod settings;
pub mod terrain;

pub use agent::{Agent, AgentState, Behavior, ControlHandle, CycleError, CycleStep};
pub use bus::{Message, MessageBus, Payload};
pub use command::{parse_command, AgentRegistry, CommandInvocation, CommandVerb};
pub use locks::{Sector, SectorLockManager};
pub use schematic::{Schematic, SchematicSource, TemplateLibrary};
pub use settings::Settings;
pub use terrain::{SimulatedTerrain, TerrainOracle};
