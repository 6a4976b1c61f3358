//! The world-interaction seam.
//!
//! Agents never talk to a world backend directly; they go through
//! [`TerrainOracle`], which exposes exactly the two capabilities the swarm
//! needs: height queries and block mutation. [`SimulatedTerrain`] is the
//! deterministic stand-in used by the demo binary and the tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerrainError {
    #[error("world backend unavailable: {0}")]
    Unavailable(String),
    #[error("invalid block request: {0}")]
    InvalidRequest(String),
}

pub type TerrainResult<T> = Result<T, TerrainError>;

/// Height query + block mutation against the world.
#[async_trait]
pub trait TerrainOracle: Send + Sync {
    /// Surface elevation at the given column.
    async fn height(&self, x: i32, z: i32) -> TerrainResult<i32>;

    /// Place (or clear, with `"air"`) a block.
    async fn set_block(&self, x: i32, y: i32, z: i32, material: &str) -> TerrainResult<()>;
}

/// Deterministic pseudo-terrain: a noisy base landscape with optional flat
/// plateaus, plus a journal of every block mutation for assertions.
pub struct SimulatedTerrain {
    base: i32,
    plateaus: Vec<Plateau>,
    blocks: Mutex<HashMap<(i32, i32, i32), String>>,
}

#[derive(Debug, Clone)]
struct Plateau {
    x1: i32,
    z1: i32,
    x2: i32,
    z2: i32,
    elevation: i32,
}

impl SimulatedTerrain {
    pub fn new(base: i32) -> Self {
        Self {
            base,
            plateaus: Vec::new(),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Overlay a flat rectangular region at a fixed elevation.
    pub fn with_plateau(mut self, x1: i32, z1: i32, x2: i32, z2: i32, elevation: i32) -> Self {
        self.plateaus.push(Plateau { x1, z1, x2, z2, elevation });
        self
    }

    /// Number of blocks placed or cleared so far.
    pub fn mutation_count(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn block_at(&self, x: i32, y: i32, z: i32) -> Option<String> {
        self.blocks.lock().unwrap().get(&(x, y, z)).cloned()
    }
}

#[async_trait]
impl TerrainOracle for SimulatedTerrain {
    async fn height(&self, x: i32, z: i32) -> TerrainResult<i32> {
        for p in &self.plateaus {
            if x >= p.x1 && x <= p.x2 && z >= p.z1 && z <= p.z2 {
                return Ok(p.elevation);
            }
        }
        let noise = (x as i64 * 3 + z as i64 * 7).rem_euclid(5) as i32;
        Ok(self.base + noise)
    }

    async fn set_block(&self, x: i32, y: i32, z: i32, material: &str) -> TerrainResult<()> {
        if material.is_empty() {
            return Err(TerrainError::InvalidRequest(format!(
                "empty material at ({x}, {y}, {z})"
            )));
        }
        self.blocks
            .lock()
            .unwrap()
            .insert((x, y, z), material.to_string());
        Ok(())
    }
}
