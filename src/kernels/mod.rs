//! Kernel contract: a validated descriptor (pure data, cheap to copy) and a
//! kernel built once from it (expensive, reused across invocations with
//! identical shapes). Kernels consume a fixed-order array of untyped runtime
//! buffers and write results in place; scratch space is passed in by the
//! caller, sized by `workspace_size`.

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeMap;

use crate::core::buffer::{DType, TensorFormat};

pub mod mha_dense;
pub mod mha_transpose;
pub mod reorder;

/// Closed set of kernel kinds the engine dispatches on. Only the attention
/// kinds are implemented in-tree; the rest belong to external kernel
/// providers that satisfy the same contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    MhaDense,
    MhaTranspose,
    SparseMatmul,
    QuantMatmul,
    Elementwise,
    Reorder,
}

impl KernelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelKind::MhaDense => "mha_dense",
            KernelKind::MhaTranspose => "mha_transpose",
            KernelKind::SparseMatmul => "sparse_matmul",
            KernelKind::QuantMatmul => "quant_matmul",
            KernelKind::Elementwise => "elementwise",
            KernelKind::Reorder => "reorder",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TensorDesc {
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub format: TensorFormat,
}

impl TensorDesc {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            shape,
            dtype,
            format: TensorFormat::Plain,
        }
    }
}

/// Fixed buffer roles for the attention kernels. The runtime buffer array
/// passed to `Kernel::execute` is indexed by these; the descriptor tensor
/// list carries the same order minus the workspace, which is not a graph
/// tensor.
pub mod mha_io {
    pub const QUERY: usize = 0;
    pub const KEY: usize = 1;
    pub const VALUE: usize = 2;
    pub const MASK: usize = 3;
    pub const DST: usize = 4;
    pub const WORKSPACE: usize = 5;
    pub const BINARY_ADD: usize = 6;
    pub const COUNT: usize = 7;
}

/// Operator descriptor: shapes, dtypes, layouts and string-encoded
/// attributes, validated once against the kernel kind's requirements.
#[derive(Debug, Clone)]
pub struct OperatorDesc {
    pub kind: KernelKind,
    pub tensors: Vec<TensorDesc>,
    pub attrs: BTreeMap<String, String>,
    pub threads: usize,
}

impl OperatorDesc {
    pub fn new(
        kind: KernelKind,
        tensors: Vec<TensorDesc>,
        attrs: BTreeMap<String, String>,
        threads: usize,
    ) -> Result<Self> {
        let arity_ok = match kind {
            // Q, K, V, mask, dst (+ optional additive mask)
            KernelKind::MhaDense => tensors.len() == 5 || tensors.len() == 6,
            KernelKind::MhaTranspose => tensors.len() == 5,
            // external kernel kinds are not validated here
            _ => true,
        };
        if !arity_ok {
            bail!(
                "kernel kind {} expects a fixed tensor list, got {} descriptors",
                kind.as_str(),
                tensors.len()
            );
        }
        Ok(Self {
            kind,
            tensors,
            attrs,
            threads,
        })
    }

    pub fn attr(&self, key: &str) -> Result<&str> {
        self.attrs
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("descriptor missing attribute '{}'", key))
    }

    pub fn attr_f32(&self, key: &str) -> Result<f32> {
        self.attr(key)?
            .parse()
            .map_err(|_| anyhow!("attribute '{}' is not a float", key))
    }

    pub fn attr_i32(&self, key: &str) -> Result<i32> {
        self.attr(key)?
            .parse()
            .map_err(|_| anyhow!("attribute '{}' is not an integer", key))
    }

    pub fn attr_is(&self, key: &str, value: &str) -> bool {
        self.attrs.get(key).map(String::as_str) == Some(value)
    }
}

/// Untyped runtime buffer: one entry per `mha_io` role. A zero pointer marks
/// an absent optional role.
#[derive(Debug, Clone, Copy)]
pub struct RtBuf {
    pub ptr: *mut u8,
    pub len: usize,
}

unsafe impl Send for RtBuf {}
unsafe impl Sync for RtBuf {}

impl RtBuf {
    pub fn null() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
        }
    }

    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    pub fn as_slice<T>(&self) -> &[T] {
        unsafe {
            std::slice::from_raw_parts(self.ptr as *const T, self.len / std::mem::size_of::<T>())
        }
    }

    pub fn as_mut_slice<T>(&self) -> &mut [T] {
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr as *mut T, self.len / std::mem::size_of::<T>())
        }
    }
}

/// A built compute kernel. Never allocates long-lived memory; the caller
/// provides scratch via the WORKSPACE role, sized by `workspace_size`.
pub trait Kernel: Send + Sync {
    fn workspace_size(&self) -> usize {
        0
    }

    fn execute(&self, rt: &[RtBuf]) -> Result<()>;
}

/// Registered implementation names per kind, default (serving-mode fallback)
/// first.
pub fn candidates(kind: KernelKind) -> &'static [&'static str] {
    match kind {
        KernelKind::MhaDense => &["mha_dense_ref", "mha_dense_blocked"],
        KernelKind::MhaTranspose => &["mha_transpose_ref"],
        _ => &[],
    }
}

/// Build a kernel for `desc`. `impl_name` selects among the registered
/// candidates; `None` picks the kind's default. Fails without partial
/// initialization when the descriptor is inconsistent with the kind.
pub fn build(desc: &OperatorDesc, impl_name: Option<&str>) -> Result<Box<dyn Kernel>> {
    let name = match impl_name {
        Some(n) => n,
        None => candidates(desc.kind)
            .first()
            .ok_or_else(|| anyhow!("no kernel implementation for kind {}", desc.kind.as_str()))?,
    };
    match name {
        "mha_dense_ref" => Ok(Box::new(mha_dense::DenseMhaKernel::new(desc, None)?)),
        "mha_dense_blocked" => Ok(Box::new(mha_dense::DenseMhaKernel::new(desc, Some(64))?)),
        "mha_transpose_ref" => Ok(Box::new(mha_transpose::TransposeMhaKernel::new(desc)?)),
        _ => Err(anyhow!(
            "unknown kernel implementation '{}' for kind {}",
            name,
            desc.kind.as_str()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_arity_validated() {
        let t = |n: usize| {
            (0..n)
                .map(|_| TensorDesc::new(vec![1, 1, 1, 1], DType::S8))
                .collect::<Vec<_>>()
        };
        assert!(OperatorDesc::new(KernelKind::MhaDense, t(5), BTreeMap::new(), 1).is_ok());
        assert!(OperatorDesc::new(KernelKind::MhaDense, t(6), BTreeMap::new(), 1).is_ok());
        assert!(OperatorDesc::new(KernelKind::MhaDense, t(4), BTreeMap::new(), 1).is_err());
        assert!(OperatorDesc::new(KernelKind::MhaTranspose, t(6), BTreeMap::new(), 1).is_err());
    }

    #[test]
    fn test_build_rejects_external_kinds() {
        let desc = OperatorDesc::new(
            KernelKind::SparseMatmul,
            vec![TensorDesc::new(vec![4, 4], DType::S8)],
            BTreeMap::new(),
            1,
        )
        .unwrap();
        assert!(build(&desc, None).is_err());
    }

    #[test]
    fn test_unknown_implementation_rejected() {
        let t = |n: usize| {
            (0..n)
                .map(|_| TensorDesc::new(vec![1, 1, 1, 1], DType::S8))
                .collect::<Vec<_>>()
        };
        let desc = OperatorDesc::new(KernelKind::MhaDense, t(5), BTreeMap::new(), 1).unwrap();
        assert!(build(&desc, Some("mha_dense_avx512")).is_err());
    }
}
