use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::core::buffer::{DType, TensorFormat};
use crate::core::memory::{Block, Memory};

/// Where a tensor's bytes currently live.
enum Binding {
    /// No buffer yet; first write acquires one from the allocator.
    Unbound,
    /// Region from the pooled allocator, returned on the last unref of a pass.
    Pooled(Block),
    /// Bytes owned by the tensor itself (weights read from file, caller data).
    Owned(Vec<u8>),
    /// Borrowed region: model input data bound per Forward call, or a mapped
    /// shared-memory weight segment. Never released here.
    External { ptr: *mut u8, len: usize },
}

/// A named, shaped, ref-counted buffer in the graph.
///
/// `life` counts the not-yet-executed consumers of the current pass; it
/// drains to zero exactly once per execution and re-arms for the next one.
/// Shape may be mutated between the Reshape and Forward phases of a pass;
/// dtype and layout are fixed at construction.
pub struct Tensor {
    name: String,
    dtype: DType,
    format: TensorFormat,
    shape: RwLock<Vec<usize>>,
    consumers: AtomicUsize,
    life: AtomicUsize,
    data: Mutex<Binding>,
    alloc: Option<Arc<dyn Memory>>,
}

// Concurrent operators only ever write disjoint output regions, and the
// binding itself is mutex-guarded.
unsafe impl Send for Tensor {}
unsafe impl Sync for Tensor {}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor").field("name", &self.name).finish()
    }
}

impl Tensor {
    pub fn new(
        name: impl Into<String>,
        dtype: DType,
        format: TensorFormat,
        shape: Vec<usize>,
        alloc: Option<Arc<dyn Memory>>,
    ) -> Self {
        Self {
            name: name.into(),
            dtype,
            format,
            shape: RwLock::new(shape),
            consumers: AtomicUsize::new(0),
            life: AtomicUsize::new(0),
            data: Mutex::new(Binding::Unbound),
            alloc,
        }
    }

    /// Standalone tensor carrying its own bytes (model inputs built by the
    /// caller, weights copied out of the weight blob, test vectors).
    pub fn from_data(
        name: impl Into<String>,
        dtype: DType,
        shape: Vec<usize>,
        data: Vec<u8>,
    ) -> Self {
        let t = Self::new(name, dtype, TensorFormat::Plain, shape, None);
        *t.data.lock().unwrap() = Binding::Owned(data);
        t
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn format(&self) -> TensorFormat {
        self.format
    }

    pub fn shape(&self) -> Vec<usize> {
        self.shape.read().unwrap().clone()
    }

    pub fn set_shape(&self, dims: Vec<usize>) {
        *self.shape.write().unwrap() = dims;
    }

    pub fn numel(&self) -> usize {
        let s = self.shape.read().unwrap();
        if s.is_empty() {
            0
        } else {
            s.iter().product()
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size()
    }

    /// Register `n` more consumers (graph construction time).
    pub fn add_life(&self, n: usize) {
        self.consumers.fetch_add(n, Ordering::Relaxed);
        self.life.fetch_add(n, Ordering::Relaxed);
    }

    pub fn life(&self) -> usize {
        self.life.load(Ordering::Acquire)
    }

    /// One consumer finished with this tensor. On the last one, a pooled
    /// buffer goes back to the allocator and life re-arms for the next pass.
    /// A tensor outside any graph has no consumers and is left alone.
    pub fn unref(&self) {
        let mut cur = self.life.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return;
            }
            match self
                .life
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
        if cur == 1 {
            let mut guard = self.data.lock().unwrap();
            if let Binding::Pooled(block) = &*guard {
                if let Some(alloc) = &self.alloc {
                    alloc.unref(block);
                }
                *guard = Binding::Unbound;
            }
            self.life
                .store(self.consumers.load(Ordering::Relaxed), Ordering::Release);
        }
    }

    /// Hand this tensor its own bytes (weight data read from file).
    pub fn bind_owned(&self, data: Vec<u8>) {
        *self.data.lock().unwrap() = Binding::Owned(data);
    }

    /// Point this tensor at caller-owned bytes for the duration of a pass.
    pub fn bind_external(&self, ptr: *mut u8, len: usize) {
        let mut guard = self.data.lock().unwrap();
        if let Binding::Pooled(block) = &*guard {
            if let Some(alloc) = &self.alloc {
                alloc.unref(block);
            }
        }
        *guard = Binding::External { ptr, len };
    }

    pub fn is_bound(&self) -> bool {
        !matches!(*self.data.lock().unwrap(), Binding::Unbound)
    }

    /// Read pointer. Fails if nothing produced this tensor yet.
    pub fn data(&self) -> Result<*const u8> {
        let guard = self.data.lock().unwrap();
        match &*guard {
            Binding::Unbound => Err(anyhow!("tensor '{}' read before produced", self.name)),
            Binding::Pooled(b) => Ok(b.ptr as *const u8),
            Binding::Owned(v) => Ok(v.as_ptr()),
            Binding::External { ptr, .. } => Ok(*ptr as *const u8),
        }
    }

    /// Write pointer, acquiring (or re-sizing) a pooled buffer on demand.
    pub fn mutable_data(&self) -> Result<*mut u8> {
        let needed = self.size_bytes();
        let mut guard = self.data.lock().unwrap();
        match &mut *guard {
            Binding::Pooled(b) if b.size >= needed => Ok(b.ptr),
            Binding::Owned(v) => Ok(v.as_mut_ptr()),
            Binding::External { ptr, .. } => Ok(*ptr),
            binding => {
                let alloc = self
                    .alloc
                    .as_ref()
                    .ok_or_else(|| anyhow!("tensor '{}' has no allocator", self.name))?;
                if let Binding::Pooled(old) = binding {
                    alloc.unref(old);
                }
                let block = alloc.acquire(needed);
                *binding = Binding::Pooled(block);
                Ok(block.ptr)
            }
        }
    }

    pub fn as_slice<T>(&self) -> Result<&[T]> {
        let ptr = self.data()?;
        let n = self.size_bytes() / std::mem::size_of::<T>();
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const T, n) })
    }

    pub fn as_mut_slice<T>(&self) -> Result<&mut [T]> {
        let ptr = self.mutable_data()?;
        let n = self.size_bytes() / std::mem::size_of::<T>();
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr as *mut T, n) })
    }
}
