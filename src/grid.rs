use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use strum_macros::{Display, EnumString};

use crate::flow::FlowField;
use crate::rounding::Rounding;
use crate::{Error, OffsetRow, Result};

/// `grid[row][col] == [dx, dy]`
pub type OffsetGrid = Vec<OffsetRow>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum JsonStyle {
    #[strum(serialize = "compact")]
    Compact,
    #[strum(serialize = "pretty")]
    Pretty,
}

impl Default for JsonStyle {
    fn default() -> Self {
        JsonStyle::Compact
    }
}

pub fn build_grid(flow: &FlowField, rounding: Rounding) -> Result<OffsetGrid> {
    let (height, width) = flow.dims();

    let offset = |channel: usize, row: usize, col: usize| {
        let value = flow.get(channel, row, col);
        rounding.to_offset(value).ok_or_else(|| Error::Value {
            value,
            channel,
            row,
            col,
        })
    };

    let mut grid = OffsetGrid::with_capacity(height);
    for row in 0..height {
        let mut offsets = OffsetRow::with_capacity(width);
        for col in 0..width {
            offsets.push([offset(0, row, col)?, offset(1, row, col)?]);
        }
        grid.push(offsets);
    }

    Ok(grid)
}

/// Returns `(rows, cols)`, taking the column count from the first row.
pub fn grid_dims(grid: &OffsetGrid) -> (usize, usize) {
    (grid.len(), grid.first().map_or(0, Vec::len))
}

/// `flows/frame_01.pth` -> `flows/frame_01.json`
pub fn output_path<P: AsRef<Path>>(input: P) -> PathBuf {
    input.as_ref().with_extension("json")
}

pub fn write_json<P: AsRef<Path>>(grid: &OffsetGrid, path: P, style: JsonStyle) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);

    let written = match style {
        JsonStyle::Compact => serde_json::to_writer(&mut writer, grid),
        JsonStyle::Pretty => serde_json::to_writer_pretty(&mut writer, grid),
    };
    written.map_err(|e| {
        if e.is_io() {
            Error::io(path, e.into())
        } else {
            Error::from(e)
        }
    })?;
    writer.flush().map_err(|e| Error::io(path, e))?;

    Ok(())
}
