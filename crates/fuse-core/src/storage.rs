use std::sync::Arc;

use half::{bf16, f16};

use crate::{DType, FuseError, Result};

/// Shared, reference-counted tensor storage.
///
/// Storage is host resident and immutable once built; tensors that share it
/// (reshape, detach, clones) share the same `Arc`.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<Vec<u8>>,
    dtype: DType,
    /// Number of logical elements (not bytes).
    numel: usize,
}

impl Storage {
    /// Allocate zeroed storage for `numel` elements of the given dtype.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        Self {
            data: Arc::new(vec![0u8; dtype.storage_bytes(numel)]),
            dtype,
            numel,
        }
    }

    /// Create storage from raw native-endian bytes.
    pub fn from_bytes(dtype: DType, numel: usize, bytes: Vec<u8>) -> Result<Self> {
        let expected = dtype.storage_bytes(numel);
        if bytes.len() != expected {
            return Err(FuseError::StorageError(format!(
                "Expected {} bytes for {} elements of {}, got {}",
                expected,
                numel,
                dtype,
                bytes.len()
            )));
        }
        Ok(Self {
            data: Arc::new(bytes),
            dtype,
            numel,
        })
    }

    /// Create storage from a slice of f32 values.
    pub fn from_f32(data: &[f32]) -> Self {
        Self {
            data: Arc::new(bytemuck::cast_slice::<f32, u8>(data).to_vec()),
            dtype: DType::F32,
            numel: data.len(),
        }
    }

    /// Create storage from a slice of u32 values.
    pub fn from_u32(data: &[u32]) -> Self {
        Self {
            data: Arc::new(bytemuck::cast_slice::<u32, u8>(data).to_vec()),
            dtype: DType::U32,
            numel: data.len(),
        }
    }

    /// Encode f64 values into `dtype`.
    ///
    /// Float targets round to nearest; integer targets truncate toward zero
    /// and saturate at the type bounds; bool stores `v != 0`.
    pub fn from_f64_values(values: &[f64], dtype: DType) -> Self {
        let mut bytes = Vec::with_capacity(dtype.storage_bytes(values.len()));
        match dtype {
            DType::Bool => bytes.extend(values.iter().map(|&v| u8::from(v != 0.0))),
            DType::U8 => bytes.extend(values.iter().map(|&v| v as u8)),
            DType::U32 => {
                for &v in values {
                    bytes.extend_from_slice(&(v as u32).to_ne_bytes());
                }
            }
            DType::I32 => {
                for &v in values {
                    bytes.extend_from_slice(&(v as i32).to_ne_bytes());
                }
            }
            DType::I64 => {
                for &v in values {
                    bytes.extend_from_slice(&(v as i64).to_ne_bytes());
                }
            }
            DType::F16 => {
                for &v in values {
                    bytes.extend_from_slice(&f16::from_f64(v).to_bits().to_ne_bytes());
                }
            }
            DType::BF16 => {
                for &v in values {
                    bytes.extend_from_slice(&bf16::from_f64(v).to_bits().to_ne_bytes());
                }
            }
            DType::F32 => {
                for &v in values {
                    bytes.extend_from_slice(&(v as f32).to_ne_bytes());
                }
            }
            DType::F64 => bytes.extend_from_slice(bytemuck::cast_slice::<f64, u8>(values)),
        }
        Self {
            data: Arc::new(bytes),
            dtype,
            numel: values.len(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Size in bytes.
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Identity of the underlying allocation, stable while any clone is alive.
    pub fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    /// Decode every element to f64. Exact for all supported dtypes except i64
    /// values beyond 2^53.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let bytes = self.as_bytes();
        match self.dtype {
            DType::Bool | DType::U8 => bytes.iter().map(|&b| b as f64).collect(),
            DType::U32 => bytes
                .chunks_exact(4)
                .map(|c| bytemuck::pod_read_unaligned::<u32>(c) as f64)
                .collect(),
            DType::I32 => bytes
                .chunks_exact(4)
                .map(|c| bytemuck::pod_read_unaligned::<i32>(c) as f64)
                .collect(),
            DType::I64 => bytes
                .chunks_exact(8)
                .map(|c| bytemuck::pod_read_unaligned::<i64>(c) as f64)
                .collect(),
            DType::F16 => bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(bytemuck::pod_read_unaligned::<u16>(c)).to_f64())
                .collect(),
            DType::BF16 => bytes
                .chunks_exact(2)
                .map(|c| bf16::from_bits(bytemuck::pod_read_unaligned::<u16>(c)).to_f64())
                .collect(),
            DType::F32 => bytes
                .chunks_exact(4)
                .map(|c| bytemuck::pod_read_unaligned::<f32>(c) as f64)
                .collect(),
            DType::F64 => bytes
                .chunks_exact(8)
                .map(bytemuck::pod_read_unaligned::<f64>)
                .collect(),
        }
    }

    /// Decode every element to f32.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self.dtype {
            DType::F32 => self
                .as_bytes()
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v as f32).collect(),
        }
    }

    /// Decode every element to u32 (integer targets truncate like a cast).
    pub fn to_u32_vec(&self) -> Vec<u32> {
        match self.dtype {
            DType::U32 => self
                .as_bytes()
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<u32>)
                .collect(),
            _ => self.to_f64_vec().into_iter().map(|v| v as u32).collect(),
        }
    }
}
