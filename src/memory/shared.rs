//! Cross-process shared weight segments.
//!
//! Multiple model instances (possibly in different processes) map the same
//! weight bytes instead of duplicating them. Each weight is a file-backed
//! segment under `/dev/shm`; a sidecar counter file, guarded by an OS file
//! lock, tracks how many instances are attached. The first attaching
//! instance creates segments, the last detaching one removes them.

use anyhow::{Context, Result};
use log::info;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;

enum SegmentMap {
    /// Created by this instance, written once during load.
    Rw(MmapMut),
    /// Attached to an existing segment, mapped read-only.
    Ro(Mmap),
}

impl SegmentMap {
    fn ptr(&self) -> *mut u8 {
        match self {
            SegmentMap::Rw(m) => m.as_ptr() as *mut u8,
            SegmentMap::Ro(m) => m.as_ptr() as *mut u8,
        }
    }
}

pub struct SharedRegion {
    base: String,
    dir: PathBuf,
    segments: Mutex<Vec<SegmentMap>>,
    detached: bool,
}

fn shm_dir() -> PathBuf {
    let dev_shm = PathBuf::from("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm
    } else {
        std::env::temp_dir()
    }
}

impl SharedRegion {
    /// Attach this instance to the region named `base`. The first attach
    /// clears any stale segment files left by a crashed run.
    pub fn attach(base: &str) -> Result<Self> {
        let dir = shm_dir();
        let region = Self {
            base: base.to_string(),
            dir,
            segments: Mutex::new(Vec::new()),
            detached: false,
        };
        let count = region.with_counter(|count| {
            if count == 0 {
                region.remove_segment_files();
            }
            count + 1
        })?;
        info!("shared weight region '{}': {} instance(s) attached", base, count);
        Ok(region)
    }

    /// Map the segment keyed by the weight's (offset, length) location.
    /// Created and filled via `init` by the first instance to ask for it;
    /// later instances map the existing file read-only.
    pub fn load_segment(
        &self,
        offset: u64,
        length: u64,
        init: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<*mut u8> {
        // same segment naming as the weight location key: offset then length
        let path = self.dir.join(format!("{}_{}{}", self.base, offset, length));
        let map = if path.exists() {
            let file = File::open(&path)
                .with_context(|| format!("open shared segment {}", path.display()))?;
            SegmentMap::Ro(unsafe { MmapOptions::new().map(&file)? })
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .with_context(|| format!("create shared segment {}", path.display()))?;
            file.set_len(length)?;
            let mut map = unsafe { MmapOptions::new().map_mut(&file)? };
            init(&mut map)?;
            SegmentMap::Rw(map)
        };
        let ptr = map.ptr();
        self.segments.lock().unwrap().push(map);
        Ok(ptr)
    }

    /// Current number of attached instances.
    pub fn instances(&self) -> Result<u32> {
        self.with_counter(|count| count)
    }

    /// Run `f` on the attach counter under the region's file lock, storing
    /// whatever it returns.
    fn with_counter(&self, f: impl FnOnce(u32) -> u32) -> Result<u32> {
        let count_path = self.counter_path();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&count_path)
            .with_context(|| format!("open shared counter {}", count_path.display()))?;
        file.lock()?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        let count: u32 = buf.trim().parse().unwrap_or(0);
        let next = f(count);
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", next)?;
        file.unlock()?;
        Ok(next)
    }

    fn counter_path(&self) -> PathBuf {
        self.dir.join(format!("{}.count", self.base))
    }

    fn remove_segment_files(&self) {
        if let Ok(entries) = fs::read_dir(&self.dir) {
            let prefix = format!("{}_", self.base);
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }

    /// Detach this instance. The physical segments disappear only when the
    /// last attached instance detaches.
    pub fn detach(&mut self) -> Result<()> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;
        self.segments.lock().unwrap().clear();
        let remaining = self.with_counter(|count| count.saturating_sub(1))?;
        if remaining == 0 {
            self.remove_segment_files();
            let _ = fs::remove_file(self.counter_path());
            info!("shared weight region '{}' removed", self.base);
        }
        Ok(())
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NAME_SEQ: AtomicU32 = AtomicU32::new(0);

    fn unique_base() -> String {
        format!(
            "qnn_rs_test_{}_{}",
            std::process::id(),
            NAME_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn test_segment_created_once_removed_once() {
        let base = unique_base();
        let mut a = SharedRegion::attach(&base).unwrap();
        let mut b = SharedRegion::attach(&base).unwrap();
        assert_eq!(b.instances().unwrap(), 2);

        let mut inits = 0;
        let pa = a
            .load_segment(16, 8, |buf| {
                inits += 1;
                buf.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
                Ok(())
            })
            .unwrap();
        let pb = b
            .load_segment(16, 8, |buf| {
                inits += 1;
                buf.fill(0);
                Ok(())
            })
            .unwrap();
        // second instance attached to the existing segment
        assert_eq!(inits, 1);
        let seen = unsafe { std::slice::from_raw_parts(pb as *const u8, 8) };
        assert_eq!(seen, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_ne!(pa, pb); // separate mappings of the same bytes

        let seg_path = shm_dir().join(format!("{}_168", base));
        assert!(seg_path.exists());
        a.detach().unwrap();
        assert!(seg_path.exists(), "segment must survive first detach");
        assert_eq!(a.instances().unwrap(), 1);
        b.detach().unwrap();
        assert!(!seg_path.exists(), "last detach removes the segment");
    }
}
