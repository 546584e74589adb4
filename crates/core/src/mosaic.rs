//! Fixed-shape integer mosaic grids in the external model's text format
//!
//! The model keeps its landscape state in plain whitespace-separated integer
//! files (age and fuel mosaics) and reports each completed step as a marker
//! file carrying a header followed by the same grid layout. `Grid` is the
//! shared in-memory form for all of them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Row-major 2D integer grid with a fixed shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    rows: usize,
    cols: usize,
    data: Vec<i32>,
}

impl Grid {
    /// Create a grid filled with a single value
    pub fn filled(rows: usize, cols: usize, value: i32) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Build a grid from row-major data
    ///
    /// # Errors
    /// Returns `MosaicError::Shape` if `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<i32>) -> Result<Self, MosaicError> {
        if data.len() != rows * cols {
            return Err(MosaicError::Shape {
                expected: rows * cols,
                got: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    /// Grid shape as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Value at (row, col), `None` when out of range
    pub fn get(&self, row: usize, col: usize) -> Option<i32> {
        if row < self.rows && col < self.cols {
            Some(self.data[row * self.cols + col])
        } else {
            None
        }
    }

    /// Set the value at (row, col); out-of-range writes are ignored
    pub fn set(&mut self, row: usize, col: usize, value: i32) {
        if row < self.rows && col < self.cols {
            self.data[row * self.cols + col] = value;
        }
    }

    /// Row-major view of the raw values
    pub fn values(&self) -> &[i32] {
        &self.data
    }

    /// Row-major boolean mask of cells `<= threshold`
    ///
    /// Burn markers encode a burned cell as a non-positive value, so
    /// `le_mask(0)` is the burned mask of a marker grid.
    pub fn le_mask(&self, threshold: i32) -> Vec<bool> {
        self.data.iter().map(|&v| v <= threshold).collect()
    }

    /// Fraction of cells equal to the corresponding cell of `other`
    ///
    /// Shapes must match; mismatched shapes compare as fully different.
    pub fn equal_fraction(&self, other: &Grid) -> f64 {
        if self.shape() != other.shape() || self.data.is_empty() {
            return 0.0;
        }
        let same = self
            .data
            .iter()
            .zip(&other.data)
            .filter(|(a, b)| a == b)
            .count();
        same as f64 / self.data.len() as f64
    }

    /// Load a grid from a whitespace-separated integer text file
    ///
    /// # Errors
    /// Returns an error on I/O failure, a non-integer token, or ragged rows.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, MosaicError> {
        Self::load_skipping(path, 0)
    }

    /// Load a grid, skipping `skip_rows` header lines first
    ///
    /// # Errors
    /// Returns an error on I/O failure, a non-integer token, or ragged rows.
    pub fn load_skipping<P: AsRef<Path>>(path: P, skip_rows: usize) -> Result<Self, MosaicError> {
        let contents =
            fs::read_to_string(&path).map_err(|e| MosaicError::Io(e.to_string()))?;

        let mut cols = 0usize;
        let mut rows = 0usize;
        let mut data = Vec::new();
        for (lineno, line) in contents.lines().enumerate().skip(skip_rows) {
            if line.trim().is_empty() {
                continue;
            }
            let mut width = 0usize;
            for token in line.split_whitespace() {
                let value: i32 = token.parse().map_err(|_| MosaicError::Parse {
                    line: lineno + 1,
                    reason: format!("not an integer: '{token}'"),
                })?;
                data.push(value);
                width += 1;
            }
            if rows == 0 {
                cols = width;
            } else if width != cols {
                return Err(MosaicError::Parse {
                    line: lineno + 1,
                    reason: format!("expected {cols} columns, found {width}"),
                });
            }
            rows += 1;
        }

        if rows == 0 {
            return Err(MosaicError::Parse {
                line: skip_rows + 1,
                reason: "no grid rows found".to_string(),
            });
        }

        Ok(Self { rows, cols, data })
    }

    /// Save the grid in the model's text format (4-wide right-aligned values)
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), MosaicError> {
        let mut out = String::with_capacity(self.data.len() * 5);
        for row in 0..self.rows {
            for col in 0..self.cols {
                if col > 0 {
                    out.push(' ');
                }
                out.push_str(&format!("{:4}", self.data[row * self.cols + col]));
            }
            out.push('\n');
        }
        fs::write(path, out).map_err(|e| MosaicError::Io(e.to_string()))
    }
}

/// Errors that can occur reading or writing mosaic grids
#[derive(Debug)]
pub enum MosaicError {
    /// File could not be read or written
    Io(String),
    /// File contents were not a rectangular integer grid
    Parse { line: usize, reason: String },
    /// Supplied data did not match the declared shape
    Shape { expected: usize, got: usize },
}

impl std::fmt::Display for MosaicError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MosaicError::Io(msg) => write!(f, "mosaic I/O failed: {msg}"),
            MosaicError::Parse { line, reason } => {
                write!(f, "mosaic parse failed at line {line}: {reason}")
            }
            MosaicError::Shape { expected, got } => {
                write!(f, "mosaic shape mismatch: expected {expected} values, got {got}")
            }
        }
    }
}

impl std::error::Error for MosaicError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(name)
    }

    #[test]
    fn test_filled_and_access() {
        let mut grid = Grid::filled(3, 4, 7);
        assert_eq!(grid.shape(), (3, 4));
        assert_eq!(grid.get(2, 3), Some(7));
        assert_eq!(grid.get(3, 0), None);

        grid.set(1, 2, -5);
        assert_eq!(grid.get(1, 2), Some(-5));
    }

    #[test]
    fn test_from_vec_shape_check() {
        assert!(Grid::from_vec(2, 2, vec![1, 2, 3, 4]).is_ok());
        let err = Grid::from_vec(2, 2, vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, MosaicError::Shape { expected: 4, got: 3 }));
    }

    #[test]
    fn test_save_load_round_trip() {
        let grid = Grid::from_vec(2, 3, vec![1, -2, 30, 400, 5, 0]).unwrap();
        let path = temp_path("mosaic_round_trip.dat");

        grid.save(&path).unwrap();
        let loaded = Grid::load(&path).unwrap();
        assert_eq!(loaded, grid);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_skipping_header() {
        let path = temp_path("mosaic_header.dat");
        fs::write(&path, "header a\nheader b\n 1 2\n 3 4\n").unwrap();

        let grid = Grid::load_skipping(&path, 2).unwrap();
        assert_eq!(grid.shape(), (2, 2));
        assert_eq!(grid.get(1, 0), Some(3));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_load_rejects_ragged_rows() {
        let path = temp_path("mosaic_ragged.dat");
        fs::write(&path, "1 2 3\n4 5\n").unwrap();

        let err = Grid::load(&path).unwrap_err();
        assert!(matches!(err, MosaicError::Parse { line: 2, .. }));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_le_mask() {
        let grid = Grid::from_vec(1, 4, vec![-1, 0, 1, 2]).unwrap();
        assert_eq!(grid.le_mask(0), vec![true, true, false, false]);
    }

    #[test]
    fn test_equal_fraction() {
        let a = Grid::from_vec(2, 2, vec![1, 2, 3, 4]).unwrap();
        let b = Grid::from_vec(2, 2, vec![1, 2, 0, 0]).unwrap();
        assert_eq!(a.equal_fraction(&b), 0.5);
        assert_eq!(a.equal_fraction(&a), 1.0);

        let c = Grid::filled(1, 4, 1);
        assert_eq!(a.equal_fraction(&c), 0.0);
    }
}
