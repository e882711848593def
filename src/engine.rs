//! The stacking engine
//!
//! An [`Engine`] owns its configuration, the scratch directory and the
//! current input list. A run loads, aligns and decomposes every image on a
//! bounded worker pool, then fuses and collapses level by level. Only one
//! run may be active per engine; the pyramid store of a run never outlives
//! it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rayon::prelude::*;

use crate::alignment::{warp, AlignedImage, Aligner, AlignmentWarning};
use crate::collapse::{collapse_with, OutputImage};
use crate::config::{EngineConfig, StorageKind};
use crate::error::{StackError, StoreError};
use crate::fusion::{FocusFuser, FusedPyramid};
use crate::image_io::{DiskLoader, ImageLoader, SourceImage};
use crate::progress::{ProgressSink, Stage, StageEvent};
use crate::pyramid::PyramidBuilder;
use crate::raster::Raster;
use crate::sharpness::regional_sharpness;
use crate::store::{BackingStore, FileBacking, LevelKey, PyramidStore};
use crate::system_info::ResidentBudget;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    AlignAndStack,
    /// Inputs are already registered; alignment is skipped.
    StackOnly,
}

impl RunMode {
    fn stages(&self) -> Vec<Stage> {
        match self {
            RunMode::AlignAndStack => Stage::ALL.to_vec(),
            RunMode::StackOnly => vec![Stage::Build, Stage::Fuse, Stage::Collapse],
        }
    }
}

/// Shared cancellation flag. Workers check it between images and between
/// levels.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StackError> {
        if self.is_cancelled() {
            log::info!("Stacking cancelled by user");
            Err(StackError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a successful run produced besides the output image.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Images left out of fusion because they could not be aligned.
    pub warnings: Vec<AlignmentWarning>,
    /// Indices of the images that were fused, ascending.
    pub images_used: Vec<usize>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(RunReport),
    Cancelled,
    Failed(StackError),
}

impl From<Result<RunReport, StackError>> for RunOutcome {
    fn from(result: Result<RunReport, StackError>) -> Self {
        match result {
            Ok(report) => RunOutcome::Completed(report),
            Err(StackError::Cancelled) => RunOutcome::Cancelled,
            Err(e) => RunOutcome::Failed(e),
        }
    }
}

/// Handle to a run started with [`Engine::run_async`].
pub struct RunHandle {
    cancel: CancelToken,
    thread: Option<JoinHandle<Result<RunReport, StackError>>>,
    spawn_error: Option<String>,
}

impl RunHandle {
    /// Ask the run to stop after the image or level it is working on.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the run to finish.
    pub fn result(mut self) -> RunOutcome {
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result.into(),
                Err(_) => RunOutcome::Failed(StackError::Worker("run thread panicked".to_string())),
            },
            None => RunOutcome::Failed(StackError::Worker(
                self.spawn_error.take().unwrap_or_else(|| "run thread missing".to_string()),
            )),
        }
    }
}

struct Inner {
    config: EngineConfig,
    scratch_dir: PathBuf,
    loader: Arc<dyn ImageLoader>,
    images: RwLock<Vec<PathBuf>>,
    output: RwLock<Option<Arc<OutputImage>>>,
    busy: AtomicBool,
}

/// Marks the engine busy for its lifetime.
struct BusyGuard {
    inner: Arc<Inner>,
}

impl BusyGuard {
    fn acquire(inner: &Arc<Inner>) -> Result<Self, StackError> {
        inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StackError::Busy)?;
        Ok(Self {
            inner: Arc::clone(inner),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.inner.busy.store(false, Ordering::SeqCst);
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Emits numbered events for one stage. Emission happens under the lock, so
/// a sink sees the events of a stage in order.
struct StageCounter<'a> {
    stage: Stage,
    total: usize,
    sink: &'a dyn ProgressSink,
    state: Mutex<(usize, Instant)>,
}

impl<'a> StageCounter<'a> {
    fn new(stage: Stage, total: usize, sink: &'a dyn ProgressSink) -> Self {
        Self {
            stage,
            total,
            sink,
            state: Mutex::new((0, Instant::now())),
        }
    }

    fn tick(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        state.0 += 1;
        let event = StageEvent {
            stage: self.stage,
            images_done: state.0,
            images_total: self.total,
            elapsed: now.duration_since(state.1),
        };
        state.1 = now;
        self.sink.on_event(&event);
    }
}

/// Cheaply clonable handle; clones share configuration, inputs and result.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Engine with default settings, decoding from disk.
    pub fn new(
        scratch_dir: impl Into<PathBuf>,
        pyramid_depth: usize,
        max_concurrency: usize,
    ) -> Result<Self, StackError> {
        Self::with_config(scratch_dir, EngineConfig::new(pyramid_depth, max_concurrency))
    }

    pub fn with_config(scratch_dir: impl Into<PathBuf>, config: EngineConfig) -> Result<Self, StackError> {
        Self::from_parts(scratch_dir, config, Arc::new(DiskLoader))
    }

    pub fn from_parts(
        scratch_dir: impl Into<PathBuf>,
        config: EngineConfig,
        loader: Arc<dyn ImageLoader>,
    ) -> Result<Self, StackError> {
        config.validate()?;
        let scratch_dir = scratch_dir.into();
        if config.storage == StorageKind::File {
            probe_scratch_dir(&scratch_dir)?;
        }
        log::info!(
            "Engine ready: depth {}, {} workers, scratch {}",
            config.pyramid_depth,
            config.max_concurrency,
            scratch_dir.display()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                scratch_dir,
                loader,
                images: RwLock::new(Vec::new()),
                output: RwLock::new(None),
                busy: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.inner.scratch_dir
    }

    pub fn is_running(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Replace the input list. Drops the previous result.
    pub fn set_images(&self, paths: Vec<PathBuf>) -> Result<(), StackError> {
        let _guard = BusyGuard::acquire(&self.inner)?;
        log::info!("Input set replaced: {} images", paths.len());
        *write(&self.inner.images) = paths;
        *write(&self.inner.output) = None;
        Ok(())
    }

    /// The list the last (or next) run consumes.
    pub fn image_paths(&self) -> Vec<PathBuf> {
        read(&self.inner.images).clone()
    }

    /// Result of the last completed run, if any.
    pub fn output_image(&self) -> Option<Arc<OutputImage>> {
        read(&self.inner.output).clone()
    }

    pub fn align_and_stack(&self, sink: &dyn ProgressSink) -> Result<RunReport, StackError> {
        self.run(RunMode::AlignAndStack, sink, &CancelToken::new())
    }

    pub fn stack(&self, sink: &dyn ProgressSink) -> Result<RunReport, StackError> {
        self.run(RunMode::StackOnly, sink, &CancelToken::new())
    }

    pub fn align_and_stack_with_cancel(
        &self,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<RunReport, StackError> {
        self.run(RunMode::AlignAndStack, sink, cancel)
    }

    pub fn stack_with_cancel(&self, sink: &dyn ProgressSink, cancel: &CancelToken) -> Result<RunReport, StackError> {
        self.run(RunMode::StackOnly, sink, cancel)
    }

    /// Run on the calling thread. Fails with [`StackError::Busy`] if another
    /// run is active.
    pub fn run(&self, mode: RunMode, sink: &dyn ProgressSink, cancel: &CancelToken) -> Result<RunReport, StackError> {
        let guard = BusyGuard::acquire(&self.inner)?;
        let result = self.execute(mode, sink, cancel);
        drop(guard);
        result
    }

    /// Run on a background thread. A run rejected as busy still yields a
    /// handle; its result is `Failed(Busy)`.
    pub fn run_async(&self, mode: RunMode, sink: Arc<dyn ProgressSink>) -> RunHandle {
        let cancel = CancelToken::new();
        let guard = BusyGuard::acquire(&self.inner);
        let engine = self.clone();
        let token = cancel.clone();

        let spawned = std::thread::Builder::new()
            .name("focusstack-run".to_string())
            .spawn(move || {
                let _guard = guard?;
                engine.execute(mode, sink.as_ref(), &token)
            });

        match spawned {
            Ok(thread) => RunHandle {
                cancel,
                thread: Some(thread),
                spawn_error: None,
            },
            Err(e) => {
                log::error!("Failed to start run thread: {}", e);
                RunHandle {
                    cancel,
                    thread: None,
                    spawn_error: Some(e.to_string()),
                }
            }
        }
    }

    fn execute(&self, mode: RunMode, sink: &dyn ProgressSink, cancel: &CancelToken) -> Result<RunReport, StackError> {
        let start = Instant::now();
        let config = &self.inner.config;
        *write(&self.inner.output) = None;

        let paths = self.image_paths();
        let dims = self.validate_inputs(&paths)?;
        log::info!(
            "Stacking {} images ({}x{}), mode {:?}, depth {}, reference {}",
            paths.len(),
            dims.0,
            dims.1,
            mode,
            config.pyramid_depth,
            config.reference_index
        );
        sink.on_run_start(&mode.stages());

        let store = self.open_store(dims)?;
        let result = self.pipeline(mode, &paths, dims, &store, sink, cancel);

        // Scratch data goes before any outcome is reported.
        let cleanup = store.clear();
        let (output, warnings, images_used) = match (result, cleanup) {
            (Ok(done), Ok(())) => done,
            (Ok(_), Err(e)) => return Err(e.into()),
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(c)) => {
                log::error!("Cleanup after failed run also failed: {}", c);
                return Err(e);
            }
        };

        *write(&self.inner.output) = Some(Arc::new(output));
        let elapsed = start.elapsed();
        log::info!(
            "Stack complete in {:?}: {} images fused, {} not aligned",
            elapsed,
            images_used.len(),
            warnings.len()
        );
        Ok(RunReport {
            warnings,
            images_used,
            elapsed,
        })
    }

    /// Input errors are all detected here, before any stage starts.
    fn validate_inputs(&self, paths: &[PathBuf]) -> Result<(u32, u32), StackError> {
        if paths.is_empty() {
            return Err(StackError::EmptyInput);
        }
        let reference = self.inner.config.reference_index;
        if reference >= paths.len() {
            return Err(StackError::InvalidReference {
                index: reference,
                count: paths.len(),
            });
        }

        let probe = |index: usize| {
            self.inner
                .loader
                .probe(&paths[index])
                .map_err(|e| StackError::Unreadable {
                    index,
                    path: paths[index].clone(),
                    reason: format!("{:#}", e),
                })
        };
        let expected = probe(reference)?;
        for index in 0..paths.len() {
            if index == reference {
                continue;
            }
            let found = probe(index)?;
            if found != expected {
                return Err(StackError::DimensionMismatch { index, expected, found });
            }
        }
        Ok(expected)
    }

    fn open_store(&self, (width, height): (u32, u32)) -> Result<PyramidStore, StackError> {
        let config = &self.inner.config;
        let budget = config.resident_levels.unwrap_or_else(|| {
            ResidentBudget::for_image(
                width as usize,
                height as usize,
                config.pyramid_depth,
                config.max_concurrency,
            )
            .levels
        });
        let store = match config.storage {
            StorageKind::File => PyramidStore::with_scratch_dir(&self.inner.scratch_dir, budget)?,
            StorageKind::Memory => PyramidStore::in_memory(budget),
        };
        Ok(store)
    }

    fn load(&self, index: usize, path: &Path, expected: (u32, u32)) -> Result<SourceImage, StackError> {
        let image = self.inner.loader.load(path).map_err(|e| {
            if index == self.inner.config.reference_index {
                StackError::ReferenceFailure {
                    index,
                    reason: format!("{:#}", e),
                }
            } else {
                StackError::Unreadable {
                    index,
                    path: path.to_path_buf(),
                    reason: format!("{:#}", e),
                }
            }
        })?;
        if image.dimensions() != expected {
            return Err(StackError::DimensionMismatch {
                index,
                expected,
                found: image.dimensions(),
            });
        }
        Ok(image)
    }

    fn pipeline(
        &self,
        mode: RunMode,
        paths: &[PathBuf],
        dims: (u32, u32),
        store: &PyramidStore,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<(OutputImage, Vec<AlignmentWarning>, Vec<usize>), StackError> {
        let config = &self.inner.config;
        let depth = config.pyramid_depth;
        let reference = config.reference_index;
        let (width, height) = (dims.0 as usize, dims.1 as usize);
        let n = paths.len();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_concurrency)
            .thread_name(|i| format!("focusstack-worker-{}", i))
            .build()
            .map_err(|e| StackError::Worker(e.to_string()))?;

        // Align + build, one image per task.
        let stage_start = Instant::now();
        let aligner = match mode {
            RunMode::AlignAndStack => {
                cancel.check()?;
                let raster = self.load(reference, &paths[reference], dims)?.to_raster();
                Some(pool.install(|| Aligner::new(&raster, reference, &config.alignment))?)
            }
            RunMode::StackOnly => None,
        };

        let align_counter = StageCounter::new(Stage::Align, n, sink);
        let build_counter = StageCounter::new(Stage::Build, n, sink);
        let builder = PyramidBuilder::new(store, depth);
        let abort = AtomicBool::new(false);

        let outcomes: Vec<Result<Option<AlignmentWarning>, StackError>> = pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|index| {
                    if abort.load(Ordering::SeqCst) {
                        return Err(StackError::Cancelled);
                    }
                    cancel.check()?;
                    let result = self.process_image(
                        index,
                        &paths[index],
                        dims,
                        aligner.as_ref(),
                        &builder,
                        &align_counter,
                        &build_counter,
                    );
                    if let Err(e) = &result {
                        if !e.is_cancelled() {
                            log::error!("Image {} failed: {}", index, e);
                            abort.store(true, Ordering::SeqCst);
                        }
                    }
                    result
                })
                .collect()
        });

        let mut warnings = Vec::new();
        let mut first_error = None;
        let mut cancelled = false;
        for outcome in outcomes {
            match outcome {
                Ok(Some(warning)) => warnings.push(warning),
                Ok(None) => {}
                Err(StackError::Cancelled) => cancelled = true,
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if cancelled {
            return Err(StackError::Cancelled);
        }
        warnings.sort_by_key(|w| w.index);
        let images_used: Vec<usize> = (0..n).filter(|i| !warnings.iter().any(|w| w.index == *i)).collect();
        log::info!(
            "Built {} pyramids in {:?} ({} levels spilled so far)",
            images_used.len(),
            stage_start.elapsed(),
            store.spill_count()
        );

        // Fuse, finest detail level first. Levels are released as soon as
        // they are fused.
        let stage_start = Instant::now();
        let fuser = FocusFuser::new(store, &images_used, &config.fusion);
        let fuse_counter = StageCounter::new(Stage::Fuse, depth + 1, sink);
        let fused = pool.install(|| -> Result<FusedPyramid, StackError> {
            let mut details = Vec::with_capacity(depth);
            for level in 0..depth {
                cancel.check()?;
                details.push(fuser.fuse_detail_level(level)?);
                for &i in &images_used {
                    store.remove(LevelKey::laplacian(i, level))?;
                    store.remove(LevelKey::gaussian(i, level))?;
                    store.remove(LevelKey::mask(i, level))?;
                }
                fuse_counter.tick();
            }
            cancel.check()?;
            let base = fuser.fuse_base(depth)?;
            for &i in &images_used {
                store.evict_image(i)?;
            }
            fuse_counter.tick();
            Ok(FusedPyramid { details, base })
        })?;
        log::info!(
            "Fused {} levels in {:?} ({} reloads)",
            depth + 1,
            stage_start.elapsed(),
            store.reload_count()
        );

        let stage_start = Instant::now();
        let collapse_counter = StageCounter::new(Stage::Collapse, depth, sink);
        let output = pool.install(|| {
            collapse_with(fused, |level| {
                collapse_counter.tick();
                if level > 0 {
                    cancel.check()?;
                }
                Ok(())
            })
        })?;
        log::info!("Collapsed pyramid in {:?}", stage_start.elapsed());

        if output.dimensions() != (width as u32, height as u32) {
            return Err(StackError::Worker(format!(
                "collapsed image is {}x{}, expected {}x{}",
                output.width(),
                output.height(),
                width,
                height
            )));
        }
        Ok((output, warnings, images_used))
    }

    /// Load, register and decompose one image.
    #[allow(clippy::too_many_arguments)]
    fn process_image(
        &self,
        index: usize,
        path: &Path,
        dims: (u32, u32),
        aligner: Option<&Aligner>,
        builder: &PyramidBuilder<'_>,
        align_counter: &StageCounter<'_>,
        build_counter: &StageCounter<'_>,
    ) -> Result<Option<AlignmentWarning>, StackError> {
        let raster: Raster = self.load(index, path, dims)?.to_raster();
        if log::log_enabled!(log::Level::Debug) {
            let (best, global, sharp) = regional_sharpness(&raster, 4);
            log::debug!(
                "Image {}: sharpness global {:.2}, best region {:.2}, {} sharp regions",
                index,
                global,
                best,
                sharp
            );
        }

        let (aligned, warning) = match aligner {
            None => (Some(AlignedImage::unwarped(raster)), None),
            Some(aligner) if index == aligner.reference_index() => {
                align_counter.tick();
                (Some(AlignedImage::unwarped(raster)), None)
            }
            Some(aligner) => {
                let outcome = match aligner.estimate(&raster) {
                    Ok(transform) => {
                        log::debug!("Image {} transform: {:?}", index, transform.matrix());
                        (Some(warp(&raster, &transform, raster.width(), raster.height())), None)
                    }
                    Err(reason) => {
                        let warning = AlignmentWarning {
                            index,
                            path: path.to_path_buf(),
                            reason,
                        };
                        log::warn!("{}", warning);
                        (None, Some(warning))
                    }
                };
                align_counter.tick();
                outcome
            }
        };

        if let Some(aligned) = aligned {
            builder.build(index, aligned)?;
        }
        build_counter.tick();
        Ok(warning)
    }
}

/// Make sure spill files can be created under `dir`.
fn probe_scratch_dir(dir: &Path) -> Result<(), StoreError> {
    let probe = FileBacking::create(dir)?;
    let written = probe.write(LevelKey::mask(0, 0), &Raster::new(1, 1, 1));
    let cleared = probe.clear();
    written?;
    cleared
}
