//! The three concrete agents of the swarm.

pub mod builder;
pub mod explorer;
pub mod miner;

pub use builder::{create_builder, BuilderBot, BuilderState};
pub use explorer::{create_explorer, ExplorerBot, ExplorerState};
pub use miner::{create_miner, MinerBot, MinerState};
