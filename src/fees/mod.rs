pub mod feed;
pub mod oracle;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeeError {
    #[error("still no fees")]
    NoData,

    #[error("empty row index")]
    EmptyIndex,

    #[error("empty column index")]
    EmptyColumns,

    #[error("invalid column content '{0}'")]
    InvalidColumn(String),

    #[error("fee matrix has {rows} data rows for {index} index entries")]
    RowCount { rows: usize, index: usize },

    #[error("fee matrix row {row} has {cells} cells for {columns} columns")]
    RowWidth {
        row: usize,
        cells: usize,
        columns: usize,
    },

    #[error("total window must be positive")]
    EmptyWindow,

    #[error("fetch fee matrix: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("fee cache lock poisoned")]
    Poisoned,
}

/// Fee matrix exactly as served by the estimation feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeMatrixBody {
    pub index: Vec<i32>,
    pub columns: Vec<String>,
    pub data: Vec<Vec<i32>>,
}

/// A validated, rectangular fee matrix.
///
/// Rows are confirmation targets in blocks, columns are confidence
/// thresholds in `0..1`, and every cell holds `100 * ln(sat/vbyte)`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeSnapshot {
    targets: Vec<i32>,
    thresholds: Vec<f64>,
    cells: Vec<Vec<i32>>,
}

impl TryFrom<FeeMatrixBody> for FeeSnapshot {
    type Error = FeeError;

    fn try_from(body: FeeMatrixBody) -> Result<Self, Self::Error> {
        if body.index.is_empty() {
            return Err(FeeError::EmptyIndex);
        }
        if body.columns.is_empty() {
            return Err(FeeError::EmptyColumns);
        }

        let thresholds = body
            .columns
            .iter()
            .map(|c| {
                c.trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| FeeError::InvalidColumn(c.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if body.data.len() != body.index.len() {
            return Err(FeeError::RowCount {
                rows: body.data.len(),
                index: body.index.len(),
            });
        }
        for (row, cells) in body.data.iter().enumerate() {
            if cells.len() != thresholds.len() {
                return Err(FeeError::RowWidth {
                    row,
                    cells: cells.len(),
                    columns: thresholds.len(),
                });
            }
        }

        Ok(Self {
            targets: body.index,
            thresholds,
            cells: body.data,
        })
    }
}

impl FeeSnapshot {
    pub fn rows(&self) -> usize {
        self.targets.len()
    }

    pub fn columns(&self) -> usize {
        self.thresholds.len()
    }

    /// Recommended sat/vbyte with `blocks_remaining` blocks left out of a
    /// `total_window` block deadline.
    ///
    /// The demanded confidence rises linearly from 0.5 when the whole window
    /// is left to 1.0 at the deadline.
    pub fn fee_rate(&self, blocks_remaining: i64, total_window: u32) -> Result<f64, FeeError> {
        if total_window == 0 {
            return Err(FeeError::EmptyWindow);
        }

        let window = f64::from(total_window);
        let blocks = blocks_remaining.clamp(0, i64::from(total_window)) as f64;
        let certainty = 0.5 + ((window - blocks) / window) / 2.0;

        let row = nearest(self.targets.iter().map(|t| f64::from(*t)), blocks);
        let column = nearest(self.thresholds.iter().copied(), certainty);

        let cell = self.cells[row][column];
        Ok((f64::from(cell) / 100.0).exp())
    }
}

/// Position of the value closest to `target`; the first one wins ties.
fn nearest(values: impl Iterator<Item = f64>, target: f64) -> usize {
    let mut best = 0;
    let mut best_distance = f64::INFINITY;
    for (i, v) in values.enumerate() {
        let distance = (v - target).abs();
        if distance < best_distance {
            best = i;
            best_distance = distance;
        }
    }
    best
}
