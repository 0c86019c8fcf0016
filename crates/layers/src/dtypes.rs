//! Precision policy shared by projections, norms and attention kernels.
//!
//! Parameters may live in `f16`/`bf16` while matmuls and softmax statistics
//! run in `f32`. [`PrecisionPolicy`] tells each layer which dtype to promote
//! to before computing and which dtype to hand back to the caller.

use candle_core::{DType, Result, Tensor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Half precision parameters project in `f32` and every reduction (norm
    /// statistics, softmax) runs in `f32` unless storage is `f64`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let (compute, reduction) = match storage {
            DType::F16 | DType::BF16 => (DType::F32, DType::F32),
            DType::F64 => (DType::F64, DType::F64),
            other => (other, DType::F32),
        };
        Self::new(storage, compute, reduction)
    }

    /// Dtype of parameters and of every tensor a layer returns.
    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.compute)
    }

    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.reduction)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast(tensor, self.storage)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::from_parameter_dtype(DType::F32)
    }
}

fn cast(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
