use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::core::memory::{Block, Memory};

const ALIGN: usize = 64;

struct Inner {
    /// size -> free region addresses of exactly that size
    free: HashMap<usize, Vec<usize>>,
    /// live region address -> size
    live: HashMap<usize, usize>,
    used: usize,
}

/// Process-wide pooled allocator. Regions are 64-byte aligned and keyed by
/// rounded size for exact reuse; the single mutex is the only cross-thread
/// serialization point in the engine.
pub struct PoolAllocator {
    inner: Mutex<Inner>,
}

impl PoolAllocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: HashMap::new(),
                live: HashMap::new(),
                used: 0,
            }),
        }
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, ALIGN).expect("bad pool layout")
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory for PoolAllocator {
    fn acquire(&self, bytes: usize) -> Block {
        let size = bytes.max(1).div_ceil(ALIGN) * ALIGN;
        let mut inner = self.inner.lock().unwrap();
        let addr = match inner.free.get_mut(&size).and_then(|v| v.pop()) {
            Some(addr) => addr,
            None => {
                let layout = Self::layout(size);
                let ptr = unsafe { alloc(layout) };
                if ptr.is_null() {
                    // host memory exhaustion is fatal
                    handle_alloc_error(layout);
                }
                ptr as usize
            }
        };
        inner.live.insert(addr, size);
        inner.used += size;
        Block {
            ptr: addr as *mut u8,
            size,
        }
    }

    fn unref(&self, block: &Block) -> bool {
        let addr = block.ptr as usize;
        let mut inner = self.inner.lock().unwrap();
        let Some(size) = inner.live.remove(&addr) else {
            return false;
        };
        inner.used -= size;
        inner.free.entry(size).or_default().push(addr);
        true
    }

    fn used_memory(&self) -> usize {
        self.inner.lock().unwrap().used
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        for (size, addrs) in inner.free.drain() {
            for addr in addrs {
                unsafe { dealloc(addr as *mut u8, Self::layout(size)) };
            }
        }
        for (addr, size) in inner.live.drain() {
            unsafe { dealloc(addr as *mut u8, Self::layout(size)) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_aligned() {
        let pool = PoolAllocator::new();
        let b = pool.acquire(100);
        assert_eq!(b.ptr as usize % ALIGN, 0);
        assert!(b.size >= 100);
        pool.unref(&b);
    }

    #[test]
    fn test_pool_reuses_released_region() {
        let pool = PoolAllocator::new();
        let a = pool.acquire(256);
        let addr = a.ptr as usize;
        assert!(pool.unref(&a));
        let b = pool.acquire(256);
        assert_eq!(b.ptr as usize, addr);
        pool.unref(&b);
    }

    #[test]
    fn test_used_memory_tracks_live_regions() {
        let pool = PoolAllocator::new();
        let a = pool.acquire(64);
        let b = pool.acquire(128);
        assert_eq!(pool.used_memory(), 192);
        pool.unref(&a);
        assert_eq!(pool.used_memory(), 128);
        // releasing a region twice is a no-op
        assert!(!pool.unref(&a));
        pool.unref(&b);
        assert_eq!(pool.used_memory(), 0);
    }
}
