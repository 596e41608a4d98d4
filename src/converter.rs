use std::path::{Path, PathBuf};

use crate::flow::FlowField;
use crate::grid::{self, JsonStyle, OffsetGrid};
use crate::rounding::Rounding;
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
    pub rounding: Rounding,
    pub style: JsonStyle,
    /// `(height, width)` the flow must have, unchecked when `None`.
    pub expected_size: Option<(usize, usize)>,
    /// Destination, defaults to the input path with a `.json` extension.
    pub output: Option<PathBuf>,
}

pub struct Converter {
    options: ConvertOptions,
}

impl Converter {
    pub fn new(options: ConvertOptions) -> Self {
        Converter { options }
    }

    pub fn convert(&self, flow: &FlowField) -> Result<OffsetGrid> {
        if let Some((height, width)) = self.options.expected_size {
            if flow.dims() != (height, width) {
                return Err(Error::Shape {
                    expected: format!("[2, {}, {}]", height, width),
                    actual: vec![2, flow.height() as i64, flow.width() as i64],
                });
            }
        }

        grid::build_grid(flow, self.options.rounding)
    }

    /// Converts the flow stored at `input` and returns the path of the JSON written.
    pub fn convert_file<P: AsRef<Path>>(&self, input: P) -> Result<PathBuf> {
        let input = input.as_ref();
        let output = self
            .options
            .output
            .clone()
            .unwrap_or_else(|| grid::output_path(input));

        let flow = FlowField::load(input)?;
        let grid = self.convert(&flow)?;

        let (rows, cols) = grid::grid_dims(&grid);
        log::info!(
            "Writing {}x{} offsets ({} rounding) to {:?}",
            rows,
            cols,
            self.options.rounding,
            output
        );
        grid::write_json(&grid, &output, self.options.style)?;

        Ok(output)
    }
}

impl Default for Converter {
    fn default() -> Self {
        Converter::new(ConvertOptions::default())
    }
}

/// Converts `input` with default options, writing next to it.
pub fn convert_file<P: AsRef<Path>>(input: P) -> Result<PathBuf> {
    Converter::default().convert_file(input)
}
