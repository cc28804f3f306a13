//! Shared stat and mmap cache.
//!
//! Mapped files live in an arena of slots owned by the cache. Connections only hold an
//! `IoEntryRef` (slot index plus generation) and look the bytes up again on every send, so a
//! handle that outlived its slot is detected instead of dangling.

use std::collections::HashMap;
use std::fs::{File, Metadata};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

/// How long a cached stat() result is trusted.
const STAT_TTL: Duration = Duration::from_secs(1);
/// Unreferenced mappings kept around for reuse.
const MAX_IDLE_MAPPINGS: usize = 64;

/// A read-only private mapping of a whole file.
pub struct Mapping {
    ptr: *mut libc::c_void,
    len: usize,
}

// The mapping is read-only and never remapped while alive.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    fn map(file: &File, len: usize) -> std::io::Result<Self> {
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        }
        .map_err(|e| std::io::Error::from_raw_os_error(e.as_errno().map_or(libc::EINVAL, |e| e as i32)))?;
        Ok(Self { ptr, len })
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!("munmap of {} bytes failed: {}", self.len, e);
        }
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Mapping({:p}, {})", self.ptr, self.len)
    }
}

/// Handle to a mapped file in the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoEntryRef {
    index: usize,
    generation: u32,
}

#[derive(Debug)]
struct Entry {
    path: PathBuf,
    modified: Option<SystemTime>,
    mapping: Arc<Mapping>,
    refs: usize,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Debug, Default)]
struct Inner {
    stats: HashMap<PathBuf, (Metadata, SystemTime)>,
    slots: Vec<Slot>,
    by_path: HashMap<PathBuf, usize>,
}

impl Inner {
    fn vacate(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if let Some(entry) = slot.entry.take() {
            if self.by_path.get(&entry.path) == Some(&index) {
                self.by_path.remove(&entry.path);
            }
        }
        slot.generation = slot.generation.wrapping_add(1);
    }

    fn idle(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| matches!(&slot.entry, Some(entry) if entry.refs == 0))
            .map(|(index, _)| index)
    }
}

#[derive(Debug)]
pub struct IoCache {
    inner: Mutex<Inner>,
    max_file_size: u64,
}

impl IoCache {
    /// Files bigger than `max_file_size` are never mapped.
    pub fn new(max_file_size: u64) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_file_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// stat() through the cache.
    pub fn stat(&self, path: &Path, now: SystemTime) -> std::io::Result<Metadata> {
        if let Some((metadata, fetched)) = self.lock().stats.get(path) {
            if now.duration_since(*fetched).map_or(false, |age| age < STAT_TTL) {
                return Ok(metadata.clone());
            }
        }
        let metadata = std::fs::metadata(path)?;
        self.lock()
            .stats
            .insert(path.to_path_buf(), (metadata.clone(), now));
        Ok(metadata)
    }

    /// Map `file` (found at `path`) or take another reference on an existing mapping of it.
    pub fn mmap(&self, path: &Path, file: &File, metadata: &Metadata) -> std::io::Result<IoEntryRef> {
        let len = metadata.len();
        if len == 0 || len > self.max_file_size {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "file size not suitable for mapping",
            ));
        }
        let modified = metadata.modified().ok();

        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(&index) = inner.by_path.get(path) {
            let slot = &mut inner.slots[index];
            let reused = match &mut slot.entry {
                Some(entry) if entry.modified == modified && entry.mapping.len() as u64 == len => {
                    entry.refs += 1;
                    true
                }
                _ => false,
            };
            if reused {
                return Ok(IoEntryRef {
                    index,
                    generation: slot.generation,
                });
            }
            if matches!(&slot.entry, Some(entry) if entry.refs > 0) {
                // Still in use; map the new version beside it.
                inner.by_path.remove(path);
            } else {
                inner.vacate(index);
            }
        }

        let mapping = Arc::new(Mapping::map(file, len as usize)?);
        let entry = Entry {
            path: path.to_path_buf(),
            modified,
            mapping,
            refs: 1,
        };

        let index = match inner.slots.iter().position(|slot| slot.entry.is_none()) {
            Some(index) => index,
            None => {
                inner.slots.push(Slot::default());
                inner.slots.len() - 1
            }
        };
        inner.slots[index].entry = Some(entry);
        inner.by_path.insert(path.to_path_buf(), index);
        let generation = inner.slots[index].generation;

        let idle: Vec<usize> = inner.idle().collect();
        let excess = idle.len().saturating_sub(MAX_IDLE_MAPPINGS);
        for index in idle.into_iter().take(excess) {
            inner.vacate(index);
        }
        tracing::trace!("mapped {} ({} bytes) into slot {}", path.display(), len, index);
        Ok(IoEntryRef { index, generation })
    }

    /// The mapped bytes behind a handle, or None if the handle is stale.
    pub fn region(&self, handle: IoEntryRef) -> Option<Arc<Mapping>> {
        let inner = self.lock();
        let slot = inner.slots.get(handle.index)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref().map(|entry| Arc::clone(&entry.mapping))
    }

    /// Give a handle back. Stale handles are ignored.
    pub fn release(&self, handle: IoEntryRef) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let orphaned = match inner.slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation => match &mut slot.entry {
                Some(entry) => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0 && inner.by_path.get(&entry.path) != Some(&handle.index)
                }
                None => false,
            },
            _ => {
                tracing::debug!("release of stale iocache handle {:?}", handle);
                false
            }
        };
        if orphaned {
            inner.vacate(handle.index);
        }
    }

    /// Drop unreferenced mappings and expired stat results.
    pub fn purge(&self, now: SystemTime) {
        let mut inner = self.lock();
        let idle: Vec<usize> = inner.idle().collect();
        for index in idle {
            inner.vacate(index);
        }
        inner
            .stats
            .retain(|_, (_, fetched)| now.duration_since(*fetched).map_or(false, |age| age < STAT_TTL));
    }

    /// Number of live mappings, referenced or not.
    pub fn mapped(&self) -> usize {
        self.lock()
            .slots
            .iter()
            .filter(|slot| slot.entry.is_some())
            .count()
    }
}
