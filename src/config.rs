use serde::{Deserialize, Serialize};

use crate::error::StackError;

/// Geometric model estimated between each image and the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionModel {
    Homography,
    Affine,
}

impl std::fmt::Display for MotionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MotionModel::Homography => write!(f, "Homography (projective)"),
            MotionModel::Affine => write!(f, "Affine"),
        }
    }
}

/// Where spilled pyramid levels go once the resident budget is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    /// Spill files under a private directory inside the scratch directory.
    File,
    /// Keep spilled levels in a secondary in-memory map (small inputs, tests).
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentConfig {
    pub motion_model: MotionModel,
    /// Upper bound on corners kept per image.
    pub max_keypoints: usize,
    /// Detection runs on a copy reduced until its longest side fits this.
    pub detect_max_dimension: usize,
    pub harris_k: f32,
    /// Corners weaker than this fraction of the strongest response are dropped.
    pub harris_threshold: f32,
    /// Half-size of the sampled patch descriptor, in detection pixels.
    pub descriptor_radius: usize,
    /// Lowe ratio test on descriptor distances.
    pub match_ratio: f32,
    /// Fewer RANSAC inliers than this marks an image as unaligned.
    pub min_matches: usize,
    /// Inlier reprojection threshold, in detection pixels.
    pub ransac_threshold: f64,
    pub ransac_iterations: usize,
    pub ransac_confidence: f64,
    pub ransac_seed: u64,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            motion_model: MotionModel::Homography,
            max_keypoints: 2000,
            detect_max_dimension: 1200,
            harris_k: 0.04,
            harris_threshold: 0.01,
            descriptor_radius: 8,
            match_ratio: 0.8,
            min_matches: 24,
            ransac_threshold: 1.5,
            ransac_iterations: 2000,
            ransac_confidence: 0.995,
            ransac_seed: 0x5eed_f0c5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Radius of the window the local detail energy is averaged over.
    pub sharpness_window: usize,
    /// Radius of the smoothing applied to the winner-take-all selection.
    pub blend_radius: usize,
    /// Mask value at or above which an image counts as having data.
    pub validity_threshold: f32,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            sharpness_window: 2,
            blend_radius: 2,
            validity_threshold: 0.95,
        }
    }
}

/// Relative cost of each pipeline stage, used for the overall percentage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageWeights {
    pub align: f64,
    pub build: f64,
    pub fuse: f64,
    pub collapse: f64,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            align: 20.0,
            build: 40.0,
            fuse: 30.0,
            collapse: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pyramid_depth: usize,
    /// Bound on concurrent per-image workers.
    pub max_concurrency: usize,
    pub reference_index: usize,
    /// Number of pyramid levels kept in memory; `None` derives it from the
    /// available system memory.
    pub resident_levels: Option<usize>,
    pub storage: StorageKind,
    pub alignment: AlignmentConfig,
    pub fusion: FusionConfig,
    pub stage_weights: StageWeights,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pyramid_depth: 6,
            max_concurrency: 8,
            reference_index: 0,
            resident_levels: None,
            storage: StorageKind::File,
            alignment: AlignmentConfig::default(),
            fusion: FusionConfig::default(),
            stage_weights: StageWeights::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(pyramid_depth: usize, max_concurrency: usize) -> Self {
        Self {
            pyramid_depth,
            max_concurrency,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), StackError> {
        let invalid = |msg: &str| Err(StackError::InvalidConfig(msg.to_string()));

        if self.pyramid_depth < 1 {
            return invalid("pyramid_depth must be at least 1");
        }
        if self.max_concurrency < 1 {
            return invalid("max_concurrency must be at least 1");
        }
        if self.resident_levels == Some(0) {
            return invalid("resident_levels must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.fusion.validity_threshold) || self.fusion.validity_threshold == 0.0 {
            return invalid("fusion.validity_threshold must be in (0, 1]");
        }
        let a = &self.alignment;
        if a.min_matches < 4 {
            return invalid("alignment.min_matches must be at least 4");
        }
        if a.detect_max_dimension < 32 {
            return invalid("alignment.detect_max_dimension must be at least 32");
        }
        if !(a.match_ratio > 0.0 && a.match_ratio <= 1.0) {
            return invalid("alignment.match_ratio must be in (0, 1]");
        }
        if !(a.ransac_threshold > 0.0) || a.ransac_iterations == 0 {
            return invalid("alignment RANSAC threshold and iterations must be positive");
        }
        let w = &self.stage_weights;
        if [w.align, w.build, w.fuse, w.collapse].iter().any(|v| !(*v >= 0.0)) {
            return invalid("stage weights must be non-negative");
        }
        Ok(())
    }
}
