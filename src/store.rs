//! Out-of-core pyramid level store
//!
//! Every pipeline stage reads and writes pyramid levels through
//! [`PyramidStore`]. At most `budget` levels stay resident; beyond that the
//! least recently used level is written to a [`BackingStore`] and reloaded
//! transparently on the next access.
//!
//! Locking: each key has its own mutex, so access to one level is serialised
//! while different levels proceed independently. The LRU bookkeeping has a
//! separate lock that is only ever taken after (never before) a slot lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::raster::Raster;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LevelKind {
    Gaussian,
    Laplacian,
    Mask,
}

impl LevelKind {
    fn tag(&self) -> &'static str {
        match self {
            LevelKind::Gaussian => "gauss",
            LevelKind::Laplacian => "lap",
            LevelKind::Mask => "mask",
        }
    }
}

/// Identifies one stored array: `(image index, level index, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelKey {
    pub image: usize,
    pub level: usize,
    pub kind: LevelKind,
}

impl LevelKey {
    pub fn new(image: usize, level: usize, kind: LevelKind) -> Self {
        Self { image, level, kind }
    }

    pub fn gaussian(image: usize, level: usize) -> Self {
        Self::new(image, level, LevelKind::Gaussian)
    }

    pub fn laplacian(image: usize, level: usize) -> Self {
        Self::new(image, level, LevelKind::Laplacian)
    }

    pub fn mask(image: usize, level: usize) -> Self {
        Self::new(image, level, LevelKind::Mask)
    }

    fn file_name(&self) -> String {
        format!("img{:05}_{}{:02}.lvl", self.image, self.kind.tag(), self.level)
    }
}

impl fmt::Display for LevelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image {} {} level {}", self.image, self.kind.tag(), self.level)
    }
}

/// Where evicted levels are kept until they are needed again.
pub trait BackingStore: Send + Sync {
    fn write(&self, key: LevelKey, level: &Raster) -> Result<(), StoreError>;
    fn read(&self, key: LevelKey) -> Result<Raster, StoreError>;
    fn remove(&self, key: LevelKey) -> Result<(), StoreError>;
    /// Drop everything written for this run.
    fn clear(&self) -> Result<(), StoreError>;
}

impl<T: BackingStore + ?Sized> BackingStore for Arc<T> {
    fn write(&self, key: LevelKey, level: &Raster) -> Result<(), StoreError> {
        (**self).write(key, level)
    }

    fn read(&self, key: LevelKey) -> Result<Raster, StoreError> {
        (**self).read(key)
    }

    fn remove(&self, key: LevelKey) -> Result<(), StoreError> {
        (**self).remove(key)
    }

    fn clear(&self) -> Result<(), StoreError> {
        (**self).clear()
    }
}

/// In-memory backing for small inputs and tests. Writes can be made to fail
/// to exercise storage error handling without touching the disk.
#[derive(Debug, Default)]
pub struct MemoryBacking {
    levels: Mutex<HashMap<LevelKey, Raster>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Total number of successful writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of levels currently held.
    pub fn len(&self) -> usize {
        lock(&self.levels).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackingStore for MemoryBacking {
    fn write(&self, key: LevelKey, level: &Raster) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                key,
                reason: "writes disabled".to_string(),
            });
        }
        lock(&self.levels).insert(key, level.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, key: LevelKey) -> Result<Raster, StoreError> {
        lock(&self.levels).get(&key).cloned().ok_or(StoreError::Missing(key))
    }

    fn remove(&self, key: LevelKey) -> Result<(), StoreError> {
        lock(&self.levels).remove(&key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        lock(&self.levels).clear();
        Ok(())
    }
}

const SPILL_MAGIC: &[u8; 4] = b"FSLV";
const SPILL_HEADER: usize = 16;

static RUN_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Spill files in a private run directory below the scratch directory.
///
/// File layout: `FSLV`, then width, height and channels as little-endian
/// `u32`, then the samples as little-endian `f32`.
#[derive(Debug)]
pub struct FileBacking {
    dir: PathBuf,
}

impl FileBacking {
    /// Create a fresh run directory inside `scratch_dir`.
    pub fn create(scratch_dir: &Path) -> Result<Self, StoreError> {
        let name = format!(
            "focusstack-{}-{}-{}",
            std::process::id(),
            chrono::Local::now().format("%Y%m%d%H%M%S"),
            RUN_COUNTER.fetch_add(1, Ordering::SeqCst)
        );
        let dir = scratch_dir.join(name);
        std::fs::create_dir(&dir).map_err(|source| StoreError::Scratch {
            path: dir.clone(),
            source,
        })?;
        log::debug!("Spill directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: LevelKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl BackingStore for FileBacking {
    fn write(&self, key: LevelKey, level: &Raster) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let spill = |source| StoreError::Spill {
            key,
            path: path.clone(),
            source,
        };

        // No create_dir_all here: a vanished scratch directory must surface
        // as an error instead of being silently recreated.
        let file = File::create(&path).map_err(spill)?;
        let mut writer = BufWriter::new(file);
        let mut header = [0u8; SPILL_HEADER];
        header[..4].copy_from_slice(SPILL_MAGIC);
        header[4..8].copy_from_slice(&(level.width() as u32).to_le_bytes());
        header[8..12].copy_from_slice(&(level.height() as u32).to_le_bytes());
        header[12..16].copy_from_slice(&(level.channels() as u32).to_le_bytes());
        writer.write_all(&header).map_err(spill)?;
        if cfg!(target_endian = "little") {
            writer.write_all(bytemuck::cast_slice(level.data())).map_err(spill)?;
        } else {
            for v in level.data() {
                writer.write_all(&v.to_le_bytes()).map_err(spill)?;
            }
        }
        writer.flush().map_err(spill)?;
        Ok(())
    }

    fn read(&self, key: LevelKey) -> Result<Raster, StoreError> {
        let path = self.path_for(key);
        let bytes = std::fs::read(&path).map_err(|source| StoreError::Reload {
            key,
            path: path.clone(),
            source,
        })?;
        let corrupt = |reason: &str| StoreError::Corrupt {
            path: path.clone(),
            reason: reason.to_string(),
        };

        if bytes.len() < SPILL_HEADER || &bytes[..4] != SPILL_MAGIC {
            return Err(corrupt("bad header"));
        }
        let field = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[i..i + 4]);
            u32::from_le_bytes(b) as usize
        };
        let (width, height, channels) = (field(4), field(8), field(12));
        let payload = &bytes[SPILL_HEADER..];
        if payload.len() != width * height * channels * 4 {
            return Err(corrupt("payload length does not match header"));
        }

        let data: Vec<f32> = if cfg!(target_endian = "little") {
            let mut data = vec![0f32; width * height * channels];
            bytemuck::cast_slice_mut::<f32, u8>(&mut data).copy_from_slice(payload);
            data
        } else {
            payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        };
        Raster::from_vec(width, height, channels, data).ok_or_else(|| corrupt("inconsistent dimensions"))
    }

    fn remove(&self, key: LevelKey) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Cleanup { path, source }),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Cleanup {
                path: self.dir.clone(),
                source,
            }),
        }
    }
}

enum Slot {
    Resident(Raster),
    Spilled,
}

#[derive(Default)]
struct Lru {
    tick: u64,
    resident: HashMap<LevelKey, u64>,
    order: BTreeMap<u64, LevelKey>,
}

impl Lru {
    fn touch(&mut self, key: LevelKey) {
        if let Some(old) = self.resident.remove(&key) {
            self.order.remove(&old);
        }
        self.tick += 1;
        self.resident.insert(key, self.tick);
        self.order.insert(self.tick, key);
    }

    fn forget(&mut self, key: LevelKey) {
        if let Some(old) = self.resident.remove(&key) {
            self.order.remove(&old);
        }
    }

    /// Pop least recently used keys until `budget` remain, sparing `protect`.
    fn take_victims(&mut self, budget: usize, protect: LevelKey) -> Vec<LevelKey> {
        let excess = self.resident.len().saturating_sub(budget);
        let victims: Vec<LevelKey> = self
            .order
            .values()
            .filter(|k| **k != protect)
            .take(excess)
            .copied()
            .collect();
        for key in &victims {
            self.forget(*key);
        }
        victims
    }
}

/// Disk-backed per-(image, level) cache with a bounded resident set.
pub struct PyramidStore {
    backing: Box<dyn BackingStore>,
    budget: usize,
    slots: Mutex<HashMap<LevelKey, Arc<Mutex<Slot>>>>,
    lru: Mutex<Lru>,
    spills: AtomicUsize,
    reloads: AtomicUsize,
}

impl PyramidStore {
    pub fn new(backing: Box<dyn BackingStore>, budget: usize) -> Self {
        Self {
            backing,
            budget: budget.max(1),
            slots: Mutex::new(HashMap::new()),
            lru: Mutex::new(Lru::default()),
            spills: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
        }
    }

    pub fn in_memory(budget: usize) -> Self {
        Self::new(Box::new(MemoryBacking::new()), budget)
    }

    pub fn with_scratch_dir(scratch_dir: &Path, budget: usize) -> Result<Self, StoreError> {
        Ok(Self::new(Box::new(FileBacking::create(scratch_dir)?), budget))
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Store (or replace) a level. May spill other levels to stay in budget.
    pub fn put(&self, key: LevelKey, level: Raster) -> Result<(), StoreError> {
        let slot = {
            let mut slots = lock(&self.slots);
            slots
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(Slot::Spilled)))
                .clone()
        };
        {
            let mut guard = lock(&slot);
            if matches!(*guard, Slot::Spilled) {
                // A new slot starts as Spilled too; removing a file that was
                // never written is a no-op.
                self.backing.remove(key)?;
            }
            *guard = Slot::Resident(level);
            lock(&self.lru).touch(key);
        }
        self.enforce_budget(key)
    }

    /// Run `f` with a borrow of the level, reloading it first if it was
    /// spilled. The borrow does not outlive the call.
    pub fn get<R>(&self, key: LevelKey, f: impl FnOnce(&Raster) -> R) -> Result<R, StoreError> {
        let slot = lock(&self.slots).get(&key).cloned().ok_or(StoreError::Missing(key))?;
        let result = {
            let mut guard = lock(&slot);
            if matches!(*guard, Slot::Spilled) {
                let level = self.backing.read(key)?;
                self.backing.remove(key)?;
                self.reloads.fetch_add(1, Ordering::Relaxed);
                log::trace!("Reloaded {}", key);
                *guard = Slot::Resident(level);
            }
            lock(&self.lru).touch(key);
            match &*guard {
                Slot::Resident(level) => f(level),
                Slot::Spilled => return Err(StoreError::Missing(key)),
            }
        };
        self.enforce_budget(key)?;
        Ok(result)
    }

    /// Copy of a level, for callers that need ownership.
    pub fn get_cloned(&self, key: LevelKey) -> Result<Raster, StoreError> {
        self.get(key, Raster::clone)
    }

    pub fn contains(&self, key: LevelKey) -> bool {
        lock(&self.slots).contains_key(&key)
    }

    /// Drop one level, resident or spilled.
    pub fn remove(&self, key: LevelKey) -> Result<(), StoreError> {
        let slot = lock(&self.slots).remove(&key);
        if let Some(slot) = slot {
            let guard = lock(&slot);
            if matches!(*guard, Slot::Spilled) {
                self.backing.remove(key)?;
            }
            lock(&self.lru).forget(key);
        }
        Ok(())
    }

    /// Drop every level belonging to one image.
    pub fn evict_image(&self, image: usize) -> Result<(), StoreError> {
        let keys: Vec<LevelKey> = lock(&self.slots)
            .keys()
            .filter(|k| k.image == image)
            .copied()
            .collect();
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }

    /// Drop everything and delete all backing data of this run.
    pub fn clear(&self) -> Result<(), StoreError> {
        lock(&self.slots).clear();
        *lock(&self.lru) = Lru::default();
        self.backing.clear()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resident_count(&self) -> usize {
        lock(&self.lru).resident.len()
    }

    pub fn spill_count(&self) -> usize {
        self.spills.load(Ordering::Relaxed)
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::Relaxed)
    }

    fn enforce_budget(&self, protect: LevelKey) -> Result<(), StoreError> {
        let victims = lock(&self.lru).take_victims(self.budget, protect);
        for victim in victims {
            let slot = match lock(&self.slots).get(&victim).cloned() {
                Some(slot) => slot,
                None => continue,
            };
            let mut guard = lock(&slot);
            if lock(&self.lru).resident.contains_key(&victim) {
                // Touched again since it was chosen.
                continue;
            }
            if let Slot::Resident(level) = std::mem::replace(&mut *guard, Slot::Spilled) {
                if let Err(e) = self.backing.write(victim, &level) {
                    log::error!("Spilling {} failed: {}", victim, e);
                    *guard = Slot::Resident(level);
                    lock(&self.lru).touch(victim);
                    return Err(e);
                }
                self.spills.fetch_add(1, Ordering::Relaxed);
                log::trace!("Spilled {}", victim);
            }
        }
        Ok(())
    }
}

impl Drop for PyramidStore {
    fn drop(&mut self) {
        if let Err(e) = self.backing.clear() {
            log::warn!("Failed to clean up scratch data: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
