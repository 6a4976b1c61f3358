//! Exploration search strategies.
//!
//! A strategy is an asynchronous coordinate generator: each `next_batch`
//! call produces one step worth of `(x, z)` columns to sample and yields to
//! the scheduler, so a long scan never starves sibling agents. Strategies
//! are selected by name at runtime (`line`, `spiral`, `random`).

pub mod rectangle;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Lateral half-width swept around line and random targets.
const DEFAULT_HALF_WIDTH: i32 = 5;

/// An async generator of coordinate batches. `None` means exhausted.
#[async_trait]
pub trait SearchStrategy: Send {
    async fn next_batch(&mut self) -> Option<Vec<(i32, i32)>>;

    fn name(&self) -> &'static str;
}

/// Advances one step along +x per batch, emitting the full lateral
/// half-width of columns at each step.
pub struct LineSearch {
    x: i32,
    z: i32,
    half_width: i32,
    remaining: u32,
}

impl LineSearch {
    pub fn new(start: (i32, i32), length: u32, half_width: i32) -> Self {
        Self {
            x: start.0,
            z: start.1,
            half_width,
            remaining: length,
        }
    }
}

#[async_trait]
impl SearchStrategy for LineSearch {
    async fn next_batch(&mut self) -> Option<Vec<(i32, i32)>> {
        if self.remaining == 0 {
            return None;
        }
        let batch: Vec<(i32, i32)> = (-self.half_width..=self.half_width)
            .map(|dz| (self.x, self.z + dz))
            .collect();
        self.x += 1;
        self.remaining -= 1;
        tokio::task::yield_now().await;
        Some(batch)
    }

    fn name(&self) -> &'static str {
        "line"
    }
}

/// Expanding square spiral out to a Chebyshev radius; every coordinate is
/// emitted exactly once, one ring per batch.
pub struct SpiralSearch {
    center: (i32, i32),
    radius: i32,
    ring: i32,
}

impl SpiralSearch {
    pub fn new(center: (i32, i32), radius: i32) -> Self {
        Self {
            center,
            radius: radius.max(0),
            ring: 0,
        }
    }

    fn ring_coords(&self, r: i32) -> Vec<(i32, i32)> {
        let (cx, cz) = self.center;
        if r == 0 {
            return vec![(cx, cz)];
        }
        let mut coords = Vec::with_capacity((8 * r) as usize);
        // top edge, left to right
        for x in (cx - r)..=(cx + r) {
            coords.push((x, cz - r));
        }
        // right edge, top to bottom (corners already emitted)
        for z in (cz - r + 1)..=(cz + r) {
            coords.push((cx + r, z));
        }
        // bottom edge, right to left
        for x in ((cx - r)..=(cx + r - 1)).rev() {
            coords.push((x, cz + r));
        }
        // left edge, bottom to top
        for z in ((cz - r + 1)..=(cz + r - 1)).rev() {
            coords.push((cx - r, z));
        }
        coords
    }
}

#[async_trait]
impl SearchStrategy for SpiralSearch {
    async fn next_batch(&mut self) -> Option<Vec<(i32, i32)>> {
        if self.ring > self.radius {
            return None;
        }
        let batch = self.ring_coords(self.ring);
        self.ring += 1;
        tokio::task::yield_now().await;
        Some(batch)
    }

    fn name(&self) -> &'static str {
        "spiral"
    }
}

/// Draws a fixed number of random offsets within a radius and emits the
/// square neighborhood of each draw.
pub struct RandomSearch {
    center: (i32, i32),
    radius: i32,
    half_width: i32,
    remaining: u32,
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(center: (i32, i32), radius: i32, count: u32, half_width: i32) -> Self {
        Self {
            center,
            radius: radius.max(1),
            half_width,
            remaining: count,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic variant for tests.
    pub fn with_seed(center: (i32, i32), radius: i32, count: u32, half_width: i32, seed: u64) -> Self {
        let mut s = Self::new(center, radius, count, half_width);
        s.rng = StdRng::seed_from_u64(seed);
        s
    }
}

#[async_trait]
impl SearchStrategy for RandomSearch {
    async fn next_batch(&mut self) -> Option<Vec<(i32, i32)>> {
        if self.remaining == 0 {
            return None;
        }
        let rx = self.center.0 + self.rng.gen_range(-self.radius..=self.radius);
        let rz = self.center.1 + self.rng.gen_range(-self.radius..=self.radius);
        let mut batch = Vec::new();
        for dx in -self.half_width..=self.half_width {
            for dz in -self.half_width..=self.half_width {
                batch.push((rx + dx, rz + dz));
            }
        }
        self.remaining -= 1;
        tokio::task::yield_now().await;
        Some(batch)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Strategy factory keyed by name; unknown names fall back to spiral.
pub fn strategy_for(name: &str, center: (i32, i32), radius: i32) -> Box<dyn SearchStrategy> {
    match name.to_ascii_lowercase().as_str() {
        "line" => Box::new(LineSearch::new(center, radius.max(1) as u32, DEFAULT_HALF_WIDTH)),
        "random" => Box::new(RandomSearch::new(
            center,
            radius,
            radius.max(1) as u32,
            DEFAULT_HALF_WIDTH,
        )),
        "spiral" => Box::new(SpiralSearch::new(center, radius)),
        other => {
            tracing::warn!(strategy = other, "unknown search strategy, using spiral");
            Box::new(SpiralSearch::new(center, radius))
        }
    }
}
