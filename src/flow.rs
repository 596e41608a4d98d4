use std::path::{Path, PathBuf};

use tch::{Device, Kind, Tensor};

use crate::torch_pickle;
use crate::{Error, Result};

/// Name looked up first when an archive holds several tensors.
pub const FLOW_ENTRY: &str = "flow";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorFormat {
    /// `torch.save` archive, libtorch serialized tensor or named tensor archive
    /// (`.pth`, `.pt`, `.ot`, ...)
    Torch,
    Npy,
    Npz,
}

impl TensorFormat {
    pub fn from_path<P: AsRef<Path>>(path: P) -> TensorFormat {
        let ext = path
            .as_ref()
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase());

        match ext.as_deref() {
            Some("npy") => TensorFormat::Npy,
            Some("npz") => TensorFormat::Npz,
            _ => TensorFormat::Torch,
        }
    }
}

/// Reads the raw tensor stored at `path`, whatever its container.
pub fn load_tensor<P: AsRef<Path>>(path: P) -> Result<Tensor> {
    let path = path.as_ref();

    // libtorch errors do not name the file, so report missing inputs here.
    std::fs::metadata(path).map_err(|e| Error::io(path, e))?;

    let format = TensorFormat::from_path(path);
    log::debug!("Reading {:?} as {:?}", path, format);

    match format {
        TensorFormat::Npy => Ok(Tensor::read_npy(path)?),
        TensorFormat::Npz => select_entry(path, Tensor::read_npz(path)?),
        TensorFormat::Torch => match torch_pickle::read_tensors(path) {
            Ok(Some(named)) => select_entry(path, named),
            Ok(None) => load_libtorch(path),
            Err(pickle_err) => {
                log::debug!("Not a readable torch.save archive: {}", pickle_err);
                load_libtorch(path).map_err(|_| pickle_err)
            }
        },
    }
}

fn load_libtorch(path: &Path) -> Result<Tensor> {
    match Tensor::load(path) {
        Ok(tensor) => Ok(tensor),
        Err(single_err) => match Tensor::load_multi(path) {
            Ok(named) => select_entry(path, named),
            Err(_) => Err(single_err.into()),
        },
    }
}

fn select_entry(path: &Path, mut named: Vec<(String, Tensor)>) -> Result<Tensor> {
    let archive_error = |reason: String| Error::Archive {
        path: PathBuf::from(path),
        reason,
    };

    if let Some(pos) = named.iter().position(|(name, _)| name == FLOW_ENTRY) {
        log::debug!("Using archive entry {:?}", FLOW_ENTRY);
        return Ok(named.swap_remove(pos).1);
    }

    match named.len() {
        0 => Err(archive_error("archive is empty".to_string())),
        1 => {
            let (name, tensor) = named.remove(0);
            log::debug!("Using archive entry {:?}", name);
            Ok(tensor)
        }
        _ => {
            let names = named
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>();
            Err(archive_error(format!(
                "several entries {:?} and none named {:?}",
                names, FLOW_ENTRY
            )))
        }
    }
}

/// A dense `[2, H, W]` displacement field, channel 0 is dx and channel 1 is dy.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowField {
    height: usize,
    width: usize,
    values: Vec<f64>,
}

impl FlowField {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let tensor = load_tensor(path)?;
        Self::from_tensor(&tensor)
    }

    /// Builds a field from a `[N, 2, H, W]` tensor, keeping batch element 0.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let size = tensor.size();
        let shape_error = || Error::Shape {
            expected: "[N, 2, H, W]".to_string(),
            actual: size.clone(),
        };

        if size.len() != 4 || size[0] < 1 || size[1] != 2 {
            return Err(shape_error());
        }
        if size[0] > 1 {
            log::warn!("Batch of {} flows, converting the first one only", size[0]);
        }

        let height = size[2] as usize;
        let width = size[3] as usize;

        let flow = tensor
            .select(0, 0)
            .to(Device::Cpu)
            .to_kind(Kind::Double)
            .contiguous();
        let values = Vec::<f64>::from(flow);

        log::info!("Loaded flow field {}x{} (from {:?})", height, width, size);

        Ok(FlowField {
            height,
            width,
            values,
        })
    }

    /// Builds a field from channel-major values (all dx, then all dy).
    pub fn from_vec(height: usize, width: usize, values: Vec<f64>) -> Result<Self> {
        if values.len() != 2 * height * width {
            return Err(Error::Shape {
                expected: format!("{} values for [2, {}, {}]", 2 * height * width, height, width),
                actual: vec![values.len() as i64],
            });
        }

        Ok(FlowField {
            height,
            width,
            values,
        })
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Value of `channel` (0 = dx, 1 = dy) at (`row`, `col`).
    pub fn get(&self, channel: usize, row: usize, col: usize) -> f64 {
        self.values[(channel * self.height + row) * self.width + col]
    }

    pub fn dx(&self, row: usize, col: usize) -> f64 {
        self.get(0, row, col)
    }

    pub fn dy(&self, row: usize, col: usize) -> f64 {
        self.get(1, row, col)
    }
}
