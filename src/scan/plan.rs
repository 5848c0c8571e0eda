//! Serpentine grid planning.
//!
//! The sample is covered row by row: even rows run left to right, odd rows
//! right to left, so the stage never travels back across the whole sample
//! between rows. Rows advance along Y, columns along X.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::GridConfig;
use crate::error::{ScanError, ScanResult};

/// Stage target in native step units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Ordered list of positions of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridPlan {
    positions: Vec<Position>,
    /// Number of increments along X (columns - 1)
    pub x_steps: u64,
    /// Number of increments along Y (rows - 1)
    pub y_steps: u64,
}

impl GridPlan {
    /// Plan the grid described by the configuration.
    pub fn from_config(grid: &GridConfig) -> ScanResult<Self> {
        plan(
            grid.travel_range_steps(),
            grid.x_increment,
            grid.y_increment,
            grid.y_offset_steps(),
        )
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn get(&self, index: usize) -> Option<Position> {
        self.positions.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// `(columns, rows)`
    pub fn dimensions(&self) -> (u64, u64) {
        (self.x_steps + 1, self.y_steps + 1)
    }

    /// The first position, where the stage parks before calibration.
    pub fn origin(&self) -> Option<Position> {
        self.positions.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter()
    }
}

/// Build the serpentine plan.
///
/// `x_steps = travel_range / x_increment` and `y_steps = travel_range / y_increment`
/// (floored); the plan holds `(x_steps + 1) * (y_steps + 1)` positions with
/// `x = x_increment * column` and `y = y_increment * row + y_offset`.
pub fn plan(
    travel_range: i64,
    x_increment: i64,
    y_increment: i64,
    y_offset: i64,
) -> ScanResult<GridPlan> {
    if x_increment <= 0 || y_increment <= 0 {
        return Err(ScanError::InvalidPlan(format!(
            "increments must be positive (x={x_increment}, y={y_increment})"
        )));
    }
    if travel_range < 0 {
        return Err(ScanError::InvalidPlan(format!(
            "travel range must not be negative, got {travel_range}"
        )));
    }

    let x_steps = travel_range / x_increment;
    let y_steps = travel_range / y_increment;
    let mut positions = Vec::with_capacity(((x_steps + 1) * (y_steps + 1)) as usize);

    for row in 0..=y_steps {
        let y = y_increment * row + y_offset;
        let columns: Box<dyn Iterator<Item = i64>> = if row % 2 == 0 {
            Box::new(0..=x_steps)
        } else {
            Box::new((0..=x_steps).rev())
        };
        positions.extend(columns.map(|column| Position::new(x_increment * column, y)));
    }

    Ok(GridPlan {
        positions,
        x_steps: x_steps as u64,
        y_steps: y_steps as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_by_two_serpentine_order() {
        let grid = plan(10, 10, 10, 0).unwrap();
        assert_eq!(
            grid.positions(),
            &[
                Position::new(0, 0),
                Position::new(10, 0),
                Position::new(10, 10),
                Position::new(0, 10),
            ]
        );
    }

    #[test]
    fn test_length_matches_floored_steps() {
        for (range, xi, yi) in [(0, 5, 5), (99, 10, 7), (414_660, 18_800, 14_100), (12, 5, 13)] {
            let grid = plan(range, xi, yi, 3).unwrap();
            let expected = ((range / xi + 1) * (range / yi + 1)) as usize;
            assert_eq!(grid.len(), expected, "range={range} xi={xi} yi={yi}");
        }
    }

    #[test]
    fn test_rows_alternate_and_stay_in_bounds() {
        let (range, xi, yi, offset) = (95, 10, 20, 7);
        let grid = plan(range, xi, yi, offset).unwrap();
        let (columns, rows) = grid.dimensions();
        assert_eq!((columns, rows), (10, 5));

        for (row, chunk) in grid.positions().chunks(columns as usize).enumerate() {
            let xs: Vec<i64> = chunk.iter().map(|p| p.x).collect();
            let mut ascending = xs.clone();
            ascending.sort_unstable();
            if row % 2 == 0 {
                assert_eq!(xs, ascending);
            } else {
                ascending.reverse();
                assert_eq!(xs, ascending);
            }
            assert!(chunk.iter().all(|p| p.y == yi * row as i64 + offset));
        }

        for p in grid.iter() {
            assert!((0..=range).contains(&p.x));
            assert!((0..=range).contains(&(p.y - offset)));
        }
    }

    #[test]
    fn test_consecutive_positions_change_one_axis() {
        let grid = plan(100, 25, 30, 1).unwrap();
        for pair in grid.positions().windows(2) {
            let dx = pair[0].x != pair[1].x;
            let dy = pair[0].y != pair[1].y;
            assert!(dx ^ dy, "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_default_grid_dimensions() {
        let grid = GridPlan::from_config(&GridConfig::default()).unwrap();
        assert_eq!(grid.dimensions(), (23, 30));
        assert_eq!(grid.origin(), Some(Position::new(0, 17_278)));
    }

    #[test]
    fn test_rejects_non_positive_increment() {
        assert!(matches!(plan(100, 0, 10, 0), Err(ScanError::InvalidPlan(_))));
    }
}
