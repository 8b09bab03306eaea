//! Grid geometry: slots, cells and pixel offsets

use crate::capture::frame::FrameFormat;
use crate::error::{Error, Result};

/// Immutable layout of the output mosaic.
///
/// Invariants (checked once in [`Geometry::new`]): `num_slots == cols * rows`,
/// `num_sources >= num_slots`, and the canvas splits into non-empty cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub num_slots: usize,
    pub num_sources: usize,
    pub cols: usize,
    pub rows: usize,
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub cell_width: u32,
    pub cell_height: u32,
}

impl Geometry {
    pub fn new(
        num_slots: usize,
        num_sources: usize,
        cols: usize,
        rows: usize,
        canvas_width: u32,
        canvas_height: u32,
    ) -> Result<Self> {
        if num_slots == 0 || cols == 0 || rows == 0 {
            return Err(Error::InvalidGeometry(
                "slots, cols and rows must be non-zero".into(),
            ));
        }
        if cols.checked_mul(rows) != Some(num_slots) {
            return Err(Error::InvalidGeometry(format!(
                "{} slots do not fill a {}x{} grid",
                num_slots, cols, rows
            )));
        }
        if num_sources < num_slots {
            return Err(Error::InvalidGeometry(format!(
                "{} sources cannot feed {} slots",
                num_sources, num_slots
            )));
        }

        let cell_width = canvas_width / cols as u32;
        let cell_height = canvas_height / rows as u32;
        if cell_width == 0 || cell_height == 0 {
            return Err(Error::InvalidGeometry(format!(
                "{}x{} canvas too small for a {}x{} grid",
                canvas_width, canvas_height, cols, rows
            )));
        }

        Ok(Self {
            num_slots,
            num_sources,
            cols,
            rows,
            canvas_width,
            canvas_height,
            cell_width,
            cell_height,
        })
    }

    /// `(row, col)` of a slot.
    pub fn position(&self, slot: usize) -> (usize, usize) {
        (slot / self.cols, slot % self.cols)
    }

    /// Top-left pixel of a slot's cell.
    pub fn offset(&self, slot: usize) -> (u32, u32) {
        let (row, col) = self.position(slot);
        (
            col as u32 * self.cell_width,
            row as u32 * self.cell_height,
        )
    }

    /// Format every frame must have before placement.
    pub fn cell_format(&self) -> FrameFormat {
        FrameFormat::rgba(self.cell_width, self.cell_height)
    }

    pub fn canvas_format(&self) -> FrameFormat {
        FrameFormat::rgba(self.canvas_width, self.canvas_height)
    }
}
