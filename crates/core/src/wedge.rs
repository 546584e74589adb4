//! Select grid cell centers within a bearing and distance range
//!
//! A selection is described by a [`WedgeShape`]: a full circle, an annular
//! ring, a pie slice bounded by an outer radius (`Wedge`), or a slice bounded
//! by both radii (`Arc`). Bearings are compass-style: degrees clockwise from
//! north, normalized to [0, 360). A bearing range may wrap past 360
//! (e.g. 350° → 10°).

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// A (row, col) grid index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCell {
    pub row: usize,
    pub col: usize,
}

impl GridCell {
    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// Real-world geometry of the simulation grid
///
/// `origin` is the center coordinate of cell (0, 0); the center of cell
/// (row, col) is `origin + (col * cell_size, row * cell_size)` with +x east
/// and +y north.
#[derive(Debug, Clone, Copy)]
pub struct GridGeometry {
    pub origin: Point2<f64>,
    pub cell_size: f64,
    pub rows: usize,
    pub cols: usize,
}

impl GridGeometry {
    pub fn new(origin: Point2<f64>, cell_size: f64, rows: usize, cols: usize) -> Self {
        Self {
            origin,
            cell_size,
            rows,
            cols,
        }
    }

    /// Real-world center coordinate of a cell
    pub fn cell_center(&self, cell: GridCell) -> Point2<f64> {
        self.origin
            + Vector2::new(
                cell.col as f64 * self.cell_size,
                cell.row as f64 * self.cell_size,
            )
    }
}

/// Shape of a selection region around a center point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WedgeShape {
    /// All cells within `radius` (center cell included)
    Circle { radius: f64 },
    /// Annular band between `inner` and `outer` (center excluded when
    /// `inner > 0`)
    Ring { inner: f64, outer: f64 },
    /// Pie slice from bearing `start` to `end` out to `radius`
    Wedge { start: f64, end: f64, radius: f64 },
    /// Pie slice bounded by both an inner and an outer radius
    Arc {
        start: f64,
        end: f64,
        inner: f64,
        outer: f64,
    },
}

/// Errors raised by degenerate selection inputs
#[derive(Debug)]
pub enum WedgeError {
    /// Bearing or distance range that cannot describe a region
    InvalidRange(String),
}

impl std::fmt::Display for WedgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WedgeError::InvalidRange(msg) => write!(f, "invalid selection range: {msg}"),
        }
    }
}

impl std::error::Error for WedgeError {}

/// Wrap a bearing into [0, 360)
pub fn normalize_bearing(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid of a tiny negative can return exactly 360.0
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Bearing of a displacement vector, degrees clockwise from north
pub fn bearing_of(v: Vector2<f64>) -> f64 {
    normalize_bearing(v.x.atan2(v.y).to_degrees())
}

// Validated, normalized form of a WedgeShape
struct Sector {
    bearing: Option<(f64, f64)>,
    inner: f64,
    outer: f64,
}

impl Sector {
    fn from_shape(shape: &WedgeShape) -> Result<Self, WedgeError> {
        let (bearing, inner, outer) = match *shape {
            WedgeShape::Circle { radius } => (None, 0.0, radius),
            WedgeShape::Ring { inner, outer } => (None, inner, outer),
            WedgeShape::Wedge { start, end, radius } => (Some((start, end)), 0.0, radius),
            WedgeShape::Arc {
                start,
                end,
                inner,
                outer,
            } => (Some((start, end)), inner, outer),
        };

        if !inner.is_finite() || !outer.is_finite() {
            return Err(WedgeError::InvalidRange(
                "distance bounds must be finite".to_string(),
            ));
        }
        if inner < 0.0 {
            return Err(WedgeError::InvalidRange(format!(
                "negative inner distance {inner}"
            )));
        }
        if outer < inner {
            return Err(WedgeError::InvalidRange(format!(
                "outer distance {outer} below inner distance {inner}"
            )));
        }

        let bearing = match bearing {
            None => None,
            Some((start, end)) => {
                if !start.is_finite() || !end.is_finite() {
                    return Err(WedgeError::InvalidRange(
                        "bearing bounds must be finite".to_string(),
                    ));
                }
                let start = normalize_bearing(start);
                let end = normalize_bearing(end);
                if start == end {
                    return Err(WedgeError::InvalidRange(format!(
                        "zero-width bearing range at {start} degrees (use Circle or Ring for a full sweep)"
                    )));
                }
                Some((start, end))
            }
        };

        Ok(Self {
            bearing,
            inner,
            outer,
        })
    }

    fn contains(&self, offset: Vector2<f64>) -> bool {
        let distance = offset.norm();
        if !(self.inner..=self.outer).contains(&distance) {
            return false;
        }
        match self.bearing {
            // the exact center has no bearing; only full-sweep shapes keep it
            Some(_) if distance == 0.0 => false,
            Some((start, end)) => {
                let b = bearing_of(offset);
                if start < end {
                    (start..=end).contains(&b)
                } else {
                    // wrapped interval past 360
                    b >= start || b <= end
                }
            }
            None => true,
        }
    }
}

/// Row-major boolean mask of cells whose center falls inside the shape
///
/// # Errors
/// Returns `WedgeError::InvalidRange` for degenerate inputs: negative or
/// non-finite distances, an inner radius above the outer, or a zero-width
/// bearing range.
pub fn mask(
    geometry: &GridGeometry,
    center: Point2<f64>,
    shape: &WedgeShape,
) -> Result<Vec<bool>, WedgeError> {
    let sector = Sector::from_shape(shape)?;
    let mut out = Vec::with_capacity(geometry.rows * geometry.cols);
    for row in 0..geometry.rows {
        for col in 0..geometry.cols {
            let offset = geometry.cell_center(GridCell::new(row, col)) - center;
            out.push(sector.contains(offset));
        }
    }
    Ok(out)
}

/// Cells whose center falls inside the shape, in row-major order
///
/// An empty result is valid; it is not an error.
///
/// # Errors
/// Returns `WedgeError::InvalidRange` for degenerate inputs (see [`mask`]).
pub fn select(
    geometry: &GridGeometry,
    center: Point2<f64>,
    shape: &WedgeShape,
) -> Result<Vec<GridCell>, WedgeError> {
    let inside = mask(geometry, center, shape)?;
    Ok((0..geometry.rows)
        .flat_map(|row| (0..geometry.cols).map(move |col| GridCell::new(row, col)))
        .zip(inside)
        .filter_map(|(cell, keep)| keep.then_some(cell))
        .collect())
}
