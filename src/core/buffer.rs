use anyhow::{anyhow, Result};

/// Data Type Enum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    BF16,
    S32,
    S8,
    U8,
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::F32 | DType::S32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::S8 | DType::U8 => 1,
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp32" => Ok(DType::F32),
            "fp16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            "s32" => Ok(DType::S32),
            "s8" => Ok(DType::S8),
            "u8" => Ok(DType::U8),
            _ => Err(anyhow!("unknown dtype '{}'", s)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "fp32",
            DType::F16 => "fp16",
            DType::BF16 => "bf16",
            DType::S32 => "s32",
            DType::S8 => "s8",
            DType::U8 => "u8",
        }
    }

    /// True for the signed integer types quantized symmetrically around zero.
    pub fn is_symmetric_int(&self) -> bool {
        matches!(self, DType::S8 | DType::S32)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F16 | DType::BF16)
    }
}

/// Physical layout tag. `Plain` is row-major over the declared dims;
/// `BatchMinor` is the blocked layout the structured-sparse kernels consume,
/// with the batch dimension leading and the sequence dimension innermost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TensorFormat {
    #[default]
    Plain,
    BatchMinor,
}

impl TensorFormat {
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "plain" => Ok(TensorFormat::Plain),
            "batch_minor" => Ok(TensorFormat::BatchMinor),
            _ => Err(anyhow!("unknown tensor format '{}'", s)),
        }
    }
}
