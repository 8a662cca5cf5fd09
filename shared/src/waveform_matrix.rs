//! Multi-channel analog output buffer for one camera cycle.
//!
//! Rows are fixed in meaning and order, matching the analog output wiring
//! (`ao0` through `ao7`):
//!
//! | Row | Output |
//! |-----|--------|
//! | 0 | scan mirror (galvo) |
//! | 1 | focus actuator (piezo z stage) |
//! | 2 | camera trigger |
//! | 3 | AOTF blanking |
//! | 4 | AOTF selector A |
//! | 5 | AOTF selector B |
//! | 6 | LED |
//! | 7 | stabilizer (twitcher) |

use std::time::Duration;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use strum::{Display, EnumIter, IntoEnumIterator};
use thiserror::Error;

/// Number of analog output rows.
pub const ROW_COUNT: usize = 8;

/// One analog output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, Display)]
pub enum OutputRow {
    #[strum(to_string = "scan_mirror")]
    ScanMirror,
    #[strum(to_string = "focus")]
    Focus,
    #[strum(to_string = "camera_trigger")]
    CameraTrigger,
    #[strum(to_string = "blanking")]
    Blanking,
    #[strum(to_string = "selector_a")]
    SelectorA,
    #[strum(to_string = "selector_b")]
    SelectorB,
    #[strum(to_string = "aux_light")]
    AuxLight,
    #[strum(to_string = "stabilizer")]
    Stabilizer,
}

impl OutputRow {
    /// Row index in the matrix.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Rows that put light on the sample.
    pub fn is_light(self) -> bool {
        matches!(
            self,
            OutputRow::Blanking | OutputRow::SelectorA | OutputRow::SelectorB | OutputRow::AuxLight
        )
    }

    /// Level the row is parked at when nothing is running.
    pub fn resting_level(self) -> f64 {
        0.0
    }
}

/// Errors from building a matrix out of rows.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatrixShapeError {
    #[error("Expected {expected} rows, got {actual}")]
    RowCount { expected: usize, actual: usize },

    #[error("Row {row} has {actual} samples, expected {expected}")]
    RowLength {
        row: OutputRow,
        expected: usize,
        actual: usize,
    },
}

/// An 8-row sample buffer, one column per output sample.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformMatrix {
    samples: Array2<f64>,
}

impl WaveformMatrix {
    /// Stack rows given in [`OutputRow`] order.
    ///
    /// Every row must have the same length as the first.
    pub fn from_rows(rows: &[Array1<f64>]) -> Result<Self, MatrixShapeError> {
        if rows.len() != ROW_COUNT {
            return Err(MatrixShapeError::RowCount {
                expected: ROW_COUNT,
                actual: rows.len(),
            });
        }

        let columns = rows[0].len();
        for (row, data) in OutputRow::iter().zip(rows) {
            if data.len() != columns {
                return Err(MatrixShapeError::RowLength {
                    row,
                    expected: columns,
                    actual: data.len(),
                });
            }
        }

        let mut samples = Array2::<f64>::zeros((ROW_COUNT, columns));
        for (mut target, data) in samples.axis_iter_mut(Axis(0)).zip(rows) {
            target.assign(data);
        }
        Ok(Self { samples })
    }

    /// A buffer with every row at its resting level.
    pub fn resting(columns: usize) -> Self {
        let mut samples = Array2::<f64>::zeros((ROW_COUNT, columns));
        for row in OutputRow::iter() {
            samples.row_mut(row.index()).fill(row.resting_level());
        }
        Self { samples }
    }

    /// Force every light row and the camera trigger to zero.
    ///
    /// Motion rows keep their shape so the mechanics see an ordinary cycle.
    pub fn make_safe(&mut self) {
        for row in OutputRow::iter() {
            if row.is_light() || row == OutputRow::CameraTrigger {
                self.samples.row_mut(row.index()).fill(0.0);
            }
        }
    }

    /// Copy of this buffer with light and trigger suppressed.
    pub fn to_safe(&self) -> Self {
        let mut safe = self.clone();
        safe.make_safe();
        safe
    }

    /// True if every row sits at its resting level.
    pub fn is_resting(&self) -> bool {
        OutputRow::iter().all(|row| {
            self.samples
                .row(row.index())
                .iter()
                .all(|&v| v == row.resting_level())
        })
    }

    /// True if no light row or trigger sample is non-zero.
    pub fn is_safe(&self) -> bool {
        OutputRow::iter()
            .filter(|row| row.is_light() || *row == OutputRow::CameraTrigger)
            .all(|row| self.samples.row(row.index()).iter().all(|&v| v == 0.0))
    }

    /// Samples for one output row.
    pub fn row(&self, row: OutputRow) -> ArrayView1<'_, f64> {
        self.samples.row(row.index())
    }

    /// The full buffer, rows by samples.
    pub fn samples(&self) -> ArrayView2<'_, f64> {
        self.samples.view()
    }

    /// Number of samples per row.
    pub fn columns(&self) -> usize {
        self.samples.ncols()
    }

    /// Playback duration at `sample_rate`.
    pub fn duration(&self, sample_rate: f64) -> Duration {
        Duration::from_secs_f64(self.columns() as f64 / sample_rate)
    }
}
