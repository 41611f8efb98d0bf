//! Host-side tensors exchanged with modules.

use anyhow::{anyhow, bail, ensure, Result};
use common::{DataType, DimensionFormat};

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Float(Vec<f32>),
    Int(Vec<i32>),
}

impl TensorData {
    fn zeroed(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::Float32 => TensorData::Float(vec![0.0; len]),
            DataType::Int32 => TensorData::Int(vec![0; len]),
        }
    }

    fn len(&self) -> usize {
        match self {
            TensorData::Float(v) => v.len(),
            TensorData::Int(v) => v.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<i32>,
    format: DimensionFormat,
    data: TensorData,
}

/// Product of the dimensions. A scalar (empty shape) holds one element.
pub fn element_count(shape: &[i32]) -> Result<usize> {
    shape.iter().try_fold(1usize, |acc, &dim| {
        let dim = usize::try_from(dim).map_err(|_| anyhow!("negative dimension {} in shape {:?}", dim, shape))?;
        acc.checked_mul(dim)
            .ok_or_else(|| anyhow!("shape {:?} is too large", shape))
    })
}

impl Tensor {
    /// Zero-filled tensor.
    pub fn new(shape: Vec<i32>, format: DimensionFormat, dtype: DataType) -> Result<Self> {
        let len = element_count(&shape)?;
        Ok(Self {
            shape,
            format,
            data: TensorData::zeroed(dtype, len),
        })
    }

    pub fn from_f32(shape: Vec<i32>, format: DimensionFormat, values: Vec<f32>) -> Result<Self> {
        Self::with_data(shape, format, TensorData::Float(values))
    }

    pub fn from_i32(shape: Vec<i32>, format: DimensionFormat, values: Vec<i32>) -> Result<Self> {
        Self::with_data(shape, format, TensorData::Int(values))
    }

    fn with_data(shape: Vec<i32>, format: DimensionFormat, data: TensorData) -> Result<Self> {
        let len = element_count(&shape)?;
        ensure!(
            data.len() == len,
            "shape {:?} holds {} elements, got {}",
            shape,
            len,
            data.len()
        );
        Ok(Self { shape, format, data })
    }

    pub fn shape(&self) -> &[i32] {
        &self.shape
    }

    pub fn format(&self) -> DimensionFormat {
        self.format
    }

    pub fn dtype(&self) -> DataType {
        match self.data {
            TensorData::Float(_) => DataType::Float32,
            TensorData::Int(_) => DataType::Int32,
        }
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    /// Copies `values` over the start of the buffer. Shorter input leaves the
    /// remaining elements untouched.
    pub fn set_f32(&mut self, values: &[f32]) -> Result<()> {
        match &mut self.data {
            TensorData::Float(data) => copy_prefix(data, values),
            TensorData::Int(_) => bail!("cannot write float data into an int32 tensor"),
        }
    }

    pub fn set_i32(&mut self, values: &[i32]) -> Result<()> {
        match &mut self.data {
            TensorData::Int(data) => copy_prefix(data, values),
            TensorData::Float(_) => bail!("cannot write int data into a float32 tensor"),
        }
    }

    pub fn as_f32(&self) -> Result<&[f32]> {
        match &self.data {
            TensorData::Float(data) => Ok(data),
            TensorData::Int(_) => bail!("tensor holds int32 data, not float32"),
        }
    }

    pub fn as_i32(&self) -> Result<&[i32]> {
        match &self.data {
            TensorData::Int(data) => Ok(data),
            TensorData::Float(_) => bail!("tensor holds float32 data, not int32"),
        }
    }
}

fn copy_prefix<T: Copy>(data: &mut [T], values: &[T]) -> Result<()> {
    ensure!(
        values.len() <= data.len(),
        "{} values do not fit a tensor of {} elements",
        values.len(),
        data.len()
    );
    data[..values.len()].copy_from_slice(values);
    Ok(())
}
