//! Flat-area detection.
//!
//! Given sampled column elevations, find the largest axis-aligned rectangle
//! of uniform elevation: the best building footprint in the scanned area.
//! Samples are grouped by elevation; each level becomes a binary occupancy
//! grid solved with the classic largest-rectangle-in-binary-matrix
//! algorithm: a per-column height histogram grown row by row, each row
//! solved by a monotonic stack. O(rows×cols) per elevation level.
//!
//! Levels are visited in ascending elevation, so area ties resolve
//! deterministically to the lowest elevation (strict `>` keeps the first
//! maximum found).

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// A maximal axis-aligned region of uniform elevation.
/// `(x1, z1)` and `(x2, z2)` are inclusive corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRectangle {
    pub x1: i32,
    pub z1: i32,
    pub x2: i32,
    pub z2: i32,
    /// Extent along x.
    pub width: u32,
    /// Extent along z.
    pub height: u32,
    pub area: u32,
    pub elevation: i32,
}

impl FlatRectangle {
    /// Whether a `(width, depth)` footprint fits inside this rectangle.
    pub fn fits(&self, width: u32, depth: u32) -> bool {
        self.width >= width && self.height >= depth
    }
}

/// Best flat rectangle across all elevation levels, or `None` for an empty
/// sample set.
pub fn best_flat_rectangle(samples: &HashMap<(i32, i32), i32>) -> Option<FlatRectangle> {
    let mut by_elevation: BTreeMap<i32, Vec<(i32, i32)>> = BTreeMap::new();
    for (&(x, z), &elevation) in samples {
        by_elevation.entry(elevation).or_default().push((x, z));
    }

    let mut best: Option<FlatRectangle> = None;
    for (elevation, cells) in by_elevation {
        if let Some(rect) = largest_at_level(elevation, &cells) {
            if best.map(|b| rect.area > b.area).unwrap_or(true) {
                best = Some(rect);
            }
        }
    }
    best
}

/// Largest all-present rectangle among the cells of one elevation level.
fn largest_at_level(elevation: i32, cells: &[(i32, i32)]) -> Option<FlatRectangle> {
    let min_x = cells.iter().map(|c| c.0).min()?;
    let max_x = cells.iter().map(|c| c.0).max()?;
    let min_z = cells.iter().map(|c| c.1).min()?;
    let max_z = cells.iter().map(|c| c.1).max()?;

    let cols = (max_x - min_x + 1) as usize;
    let rows = (max_z - min_z + 1) as usize;
    let mut grid = vec![false; cols * rows];
    for &(x, z) in cells {
        grid[(z - min_z) as usize * cols + (x - min_x) as usize] = true;
    }

    let mut histogram = vec![0u32; cols];
    let mut best: Option<FlatRectangle> = None;
    for row in 0..rows {
        for col in 0..cols {
            histogram[col] = if grid[row * cols + col] {
                histogram[col] + 1
            } else {
                0
            };
        }
        if let Some((left, right, bar_height, area)) = largest_in_histogram(&histogram) {
            if best.map(|b| area > b.area).unwrap_or(true) {
                let x1 = min_x + left as i32;
                let x2 = min_x + right as i32;
                let z2 = min_z + row as i32;
                let z1 = z2 - (bar_height as i32 - 1);
                best = Some(FlatRectangle {
                    x1,
                    z1,
                    x2,
                    z2,
                    width: (x2 - x1 + 1) as u32,
                    height: bar_height,
                    area,
                    elevation,
                });
            }
        }
    }
    best
}

/// Largest rectangle under a histogram via a monotonic stack of column
/// indices. Returns `(left, right, height, area)` with inclusive column
/// bounds, or `None` for an all-zero histogram.
fn largest_in_histogram(heights: &[u32]) -> Option<(usize, usize, u32, u32)> {
    let mut stack: Vec<usize> = Vec::with_capacity(heights.len());
    let mut best: Option<(usize, usize, u32, u32)> = None;

    for i in 0..=heights.len() {
        let current = if i < heights.len() { heights[i] } else { 0 };
        while let Some(&top) = stack.last() {
            if heights[top] <= current {
                break;
            }
            stack.pop();
            let height = heights[top];
            let left = stack.last().map(|&l| l + 1).unwrap_or(0);
            let right = i - 1;
            let area = height * (right - left + 1) as u32;
            if height > 0 && best.map(|b| area > b.3).unwrap_or(true) {
                best = Some((left, right, height, area));
            }
        }
        stack.push(i);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(pairs: &[((i32, i32), i32)]) -> HashMap<(i32, i32), i32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_histogram_basic() {
        assert_eq!(largest_in_histogram(&[2, 1, 2]), Some((0, 2, 1, 3)));
        assert_eq!(largest_in_histogram(&[0, 0, 0]), None);
        let (left, right, height, area) = largest_in_histogram(&[1, 3, 3, 1]).unwrap();
        assert_eq!((left, right, height, area), (1, 2, 3, 6));
    }

    #[test]
    fn test_square_plus_outlier() {
        // 2x2 at elevation 5, one stray cell at elevation 3
        let map = samples(&[
            ((0, 0), 5),
            ((1, 0), 5),
            ((0, 1), 5),
            ((1, 1), 5),
            ((2, 0), 3),
        ]);
        let rect = best_flat_rectangle(&map).unwrap();
        assert_eq!((rect.x1, rect.z1, rect.x2, rect.z2), (0, 0, 1, 1));
        assert_eq!(rect.area, 4);
        assert_eq!(rect.elevation, 5);
        assert_eq!((rect.width, rect.height), (2, 2));
    }

    #[test]
    fn test_no_adjacent_equal_cells() {
        // checkerboard of distinct elevations: best is a single cell
        let map = samples(&[((0, 0), 1), ((1, 0), 2), ((0, 1), 3), ((1, 1), 4)]);
        let rect = best_flat_rectangle(&map).unwrap();
        assert_eq!(rect.area, 1);
    }

    #[test]
    fn test_empty_samples() {
        assert!(best_flat_rectangle(&HashMap::new()).is_none());
    }

    #[test]
    fn test_non_square_rectangle() {
        // 4 wide x 2 deep strip at elevation 7
        let mut pairs = Vec::new();
        for x in 10..14 {
            for z in -1..1 {
                pairs.push(((x, z), 7));
            }
        }
        pairs.push(((14, 0), 6));
        let rect = best_flat_rectangle(&samples(&pairs)).unwrap();
        assert_eq!((rect.x1, rect.z1, rect.x2, rect.z2), (10, -1, 13, 0));
        assert_eq!((rect.width, rect.height, rect.area), (4, 2, 8));
        assert_eq!(rect.elevation, 7);
    }

    #[test]
    fn test_area_tie_resolves_to_lowest_elevation() {
        // two disjoint 2x2 squares with equal area at elevations 3 and 9
        let map = samples(&[
            ((0, 0), 3),
            ((1, 0), 3),
            ((0, 1), 3),
            ((1, 1), 3),
            ((10, 10), 9),
            ((11, 10), 9),
            ((10, 11), 9),
            ((11, 11), 9),
        ]);
        let rect = best_flat_rectangle(&map).unwrap();
        assert_eq!(rect.area, 4);
        assert_eq!(rect.elevation, 3);
    }

    #[test]
    fn test_l_shape_picks_larger_arm() {
        // L shape at one elevation: 3x1 arm and 1x3 arm joined at a corner,
        // plus a 2x2 block elsewhere that should win
        let map = samples(&[
            ((0, 0), 5),
            ((1, 0), 5),
            ((2, 0), 5),
            ((0, 1), 5),
            ((0, 2), 5),
            ((10, 0), 5),
            ((11, 0), 5),
            ((10, 1), 5),
            ((11, 1), 5),
        ]);
        let rect = best_flat_rectangle(&map).unwrap();
        assert_eq!(rect.area, 4);
        assert_eq!((rect.x1, rect.z1), (10, 0));
    }

    #[test]
    fn test_fits() {
        let rect = FlatRectangle {
            x1: 0,
            z1: 0,
            x2: 3,
            z2: 2,
            width: 4,
            height: 3,
            area: 12,
            elevation: 64,
        };
        assert!(rect.fits(4, 3));
        assert!(rect.fits(3, 2));
        assert!(!rect.fits(5, 1));
        assert!(!rect.fits(1, 4));
    }
}
