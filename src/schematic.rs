//! Structure templates and build planning.
//!
//! A [`Schematic`] is the parsed form of a structure: its dimensions, its
//! per-voxel materials, and the material totals the builder turns into a
//! bill of materials. [`TemplateLibrary`] is the default source: a couple of
//! built-in shapes plus JSON template files from an optional directory.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bill of materials: required (or held) quantity per material.
pub type Bom = BTreeMap<String, u32>;

#[derive(Debug, Error)]
pub enum SchematicError {
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    #[error("failed to read template file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed template file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("template '{0}' contains no blocks")]
    Empty(String),
}

/// One voxel of a structure, in schematic-local coordinates until a build
/// plan anchors it to a world origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPlacement {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub material: String,
}

/// One horizontal slice of a build plan, built bottom-up.
#[derive(Debug, Clone)]
pub struct Layer {
    pub index: u32,
    pub blocks: Vec<BlockPlacement>,
}

/// Ordered list of layers; build progress counts completed layers and is
/// bounded by `layers.len()`.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub layers: Vec<Layer>,
}

impl BuildPlan {
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// A parsed structure: size, voxels, and material totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schematic {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub blocks: Vec<BlockPlacement>,
}

impl Schematic {
    /// A solid box of a single material.
    pub fn cuboid(name: &str, width: u32, height: u32, depth: u32, material: &str) -> Self {
        let mut blocks = Vec::with_capacity((width * height * depth) as usize);
        for y in 0..height {
            for x in 0..width {
                for z in 0..depth {
                    blocks.push(BlockPlacement {
                        x: x as i32,
                        y: y as i32,
                        z: z as i32,
                        material: material.to_string(),
                    });
                }
            }
        }
        Self {
            name: name.to_string(),
            width,
            height,
            depth,
            blocks,
        }
    }

    /// Required quantity per material.
    pub fn material_totals(&self) -> Bom {
        let mut totals = Bom::new();
        for block in &self.blocks {
            *totals.entry(block.material.clone()).or_insert(0) += 1;
        }
        totals
    }

    /// Ground footprint as `(width, depth)`.
    pub fn footprint(&self) -> (u32, u32) {
        (self.width, self.depth)
    }

    /// Anchor the schematic at a world origin and slice it into bottom-up
    /// layers.
    pub fn build_plan(&self, origin: (i32, i32, i32)) -> BuildPlan {
        let (ox, oy, oz) = origin;
        let mut layers: BTreeMap<i32, Vec<BlockPlacement>> = BTreeMap::new();
        for block in &self.blocks {
            layers.entry(block.y).or_default().push(BlockPlacement {
                x: ox + block.x,
                y: oy + block.y,
                z: oz + block.z,
                material: block.material.clone(),
            });
        }
        BuildPlan {
            layers: layers
                .into_values()
                .enumerate()
                .map(|(index, blocks)| Layer {
                    index: index as u32,
                    blocks,
                })
                .collect(),
        }
    }
}

/// Anything that can produce a schematic by name.
pub trait SchematicSource: Send + Sync {
    fn load(&self, name: &str) -> Result<Schematic, SchematicError>;
}

/// On-disk JSON template: a named box of one material.
#[derive(Debug, Deserialize)]
struct TemplateFile {
    name: String,
    width: u32,
    height: u32,
    depth: u32,
    material: String,
}

/// Built-in templates plus JSON files from an optional directory.
/// Directory files shadow built-ins of the same name.
pub struct TemplateLibrary {
    dir: Option<PathBuf>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self { dir: None }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    fn builtin(name: &str) -> Option<Schematic> {
        match name {
            "house_small" => Some(Schematic::cuboid("house_small", 4, 3, 4, "stone")),
            "tower" => Some(Schematic::cuboid("tower", 3, 6, 3, "stone")),
            "hut" => Some(Schematic::cuboid("hut", 2, 2, 2, "wood")),
            _ => None,
        }
    }
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl SchematicSource for TemplateLibrary {
    fn load(&self, name: &str) -> Result<Schematic, SchematicError> {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{name}.json"));
            if path.exists() {
                let raw = std::fs::read_to_string(&path)?;
                let tpl: TemplateFile = serde_json::from_str(&raw)?;
                let schematic =
                    Schematic::cuboid(&tpl.name, tpl.width, tpl.height, tpl.depth, &tpl.material);
                if schematic.blocks.is_empty() {
                    return Err(SchematicError::Empty(name.to_string()));
                }
                return Ok(schematic);
            }
        }
        Self::builtin(name).ok_or_else(|| SchematicError::UnknownTemplate(name.to_string()))
    }
}
