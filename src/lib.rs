//! Focus stacking engine.
//!
//! Aligns a bracket of photographs focused at different distances, decomposes
//! each into a Laplacian pyramid, keeps the sharpest detail at every scale and
//! collapses the result into one image. Pyramid levels live in a bounded,
//! disk-backed store so large stacks do not have to fit in memory.
//!
//! ```no_run
//! use focusstack::{Engine, NullSink};
//!
//! let engine = Engine::new("/tmp", 6, 8)?;
//! engine.set_images(vec!["a.tif".into(), "b.tif".into()])?;
//! engine.align_and_stack(&NullSink)?;
//! let output = engine.output_image();
//! # Ok::<(), focusstack::StackError>(())
//! ```

pub mod alignment;
pub mod collapse;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod fusion;
pub mod image_io;
pub mod logger;
pub mod progress;
pub mod pyramid;
pub mod ransac;
pub mod raster;
pub mod settings;
pub mod sharpness;
pub mod store;
pub mod system_info;
pub mod transform;

pub use alignment::{AlignedImage, Aligner, AlignmentWarning};
pub use collapse::OutputImage;
pub use config::{AlignmentConfig, EngineConfig, FusionConfig, MotionModel, StageWeights, StorageKind};
pub use engine::{CancelToken, Engine, RunHandle, RunMode, RunOutcome, RunReport};
pub use error::{StackError, StoreError};
pub use image_io::{DiskLoader, ImageLoader, MemoryLoader, SourceImage};
pub use progress::{NullSink, ProgressModel, ProgressSink, Stage, StageEvent};
pub use raster::Raster;
pub use store::PyramidStore;
pub use transform::Transform;
