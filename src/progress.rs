//! Progress events and the percentage / ETA model
//!
//! Stages emit one [`StageEvent`] per finished unit of work (an image for
//! align and build, a level for fuse and collapse). `elapsed` is the time
//! since the previous event of the same stage, so with parallel workers it
//! measures throughput rather than per-worker latency.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::config::StageWeights;

const HISTORY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Align,
    Build,
    Fuse,
    Collapse,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Align, Stage::Build, Stage::Fuse, Stage::Collapse];

    pub fn key(&self) -> &'static str {
        match self {
            Stage::Align => "align",
            Stage::Build => "build",
            Stage::Fuse => "fuse",
            Stage::Collapse => "collapse",
        }
    }

    pub fn from_key(key: &str) -> Option<Stage> {
        Stage::ALL.into_iter().find(|s| s.key() == key)
    }

    fn weight(&self, weights: &StageWeights) -> f64 {
        match self {
            Stage::Align => weights.align,
            Stage::Build => weights.build,
            Stage::Fuse => weights.fuse,
            Stage::Collapse => weights.collapse,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageEvent {
    pub stage: Stage,
    pub images_done: usize,
    pub images_total: usize,
    pub elapsed: Duration,
}

impl StageEvent {
    pub fn stage_key(&self) -> &'static str {
        self.stage.key()
    }

    pub fn is_stage_complete(&self) -> bool {
        self.images_done >= self.images_total
    }
}

/// Receiver of progress events. Events of one stage arrive in order; events
/// of different stages may interleave.
pub trait ProgressSink: Send + Sync {
    /// Called once before the first event of a run with the stages it will
    /// go through.
    fn on_run_start(&self, _stages: &[Stage]) {}

    fn on_event(&self, event: &StageEvent);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_event(&self, _event: &StageEvent) {}
}

impl ProgressSink for Sender<StageEvent> {
    fn on_event(&self, event: &StageEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(event.clone());
    }
}

impl ProgressSink for Mutex<ProgressModel> {
    fn on_run_start(&self, stages: &[Stage]) {
        self.lock().unwrap_or_else(PoisonError::into_inner).begin_run(stages);
    }

    fn on_event(&self, event: &StageEvent) {
        self.lock().unwrap_or_else(PoisonError::into_inner).record(event);
    }
}

#[derive(Debug, Clone, Default)]
struct StageState {
    done: usize,
    total: usize,
    fraction: f64,
    history: VecDeque<Duration>,
}

impl StageState {
    fn mean_duration(&self) -> Option<Duration> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<Duration>() / self.history.len() as u32)
    }
}

/// Turns stage events into an overall percentage and a time estimate.
#[derive(Debug, Clone)]
pub struct ProgressModel {
    weights: StageWeights,
    stages: Vec<Stage>,
    state: HashMap<Stage, StageState>,
    percentage: f64,
    observed: Duration,
}

impl ProgressModel {
    pub fn new(weights: StageWeights) -> Self {
        let mut model = Self {
            weights,
            stages: Vec::new(),
            state: HashMap::new(),
            percentage: 0.0,
            observed: Duration::ZERO,
        };
        model.begin_run(&Stage::ALL);
        model
    }

    /// Reset for a new run over `stages`; timing history is discarded.
    pub fn begin_run(&mut self, stages: &[Stage]) {
        self.stages = stages.to_vec();
        self.state.clear();
        self.percentage = 0.0;
        self.observed = Duration::ZERO;
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn normalized_weight(&self, stage: Stage) -> f64 {
        let total: f64 = self.stages.iter().map(|s| s.weight(&self.weights).max(0.0)).sum();
        if total > 0.0 {
            stage.weight(&self.weights).max(0.0) / total
        } else {
            1.0 / self.stages.len().max(1) as f64
        }
    }

    pub fn record(&mut self, event: &StageEvent) {
        if !self.stages.contains(&event.stage) {
            self.stages.push(event.stage);
        }
        let state = self.state.entry(event.stage).or_default();
        state.done = state.done.max(event.images_done.min(event.images_total));
        state.total = event.images_total;
        let fraction = if event.images_total == 0 {
            1.0
        } else {
            state.done as f64 / event.images_total as f64
        };
        state.fraction = state.fraction.max(fraction);
        state.history.push_back(event.elapsed);
        if state.history.len() > HISTORY_LEN {
            state.history.pop_front();
        }
        self.observed += event.elapsed;

        let current: f64 = self
            .stages
            .iter()
            .map(|s| self.normalized_weight(*s) * self.state.get(s).map_or(0.0, |st| st.fraction))
            .sum::<f64>()
            * 100.0;
        self.percentage = self.percentage.max(current.clamp(0.0, 100.0));
    }

    /// Weighted completion of the run, never decreasing within a run.
    pub fn overall_percentage(&self) -> f64 {
        self.percentage
    }

    /// Remaining time: per-unit means for stages that have history, and the
    /// run's overall rate for stages that have not started yet.
    pub fn eta(&self) -> Duration {
        let mut seconds = 0.0;
        let mut unstarted_share = 0.0;
        for stage in &self.stages {
            match self.state.get(stage).and_then(|s| s.mean_duration().map(|m| (s, m))) {
                Some((state, mean)) => {
                    let remaining = state.total.saturating_sub(state.done);
                    seconds += mean.as_secs_f64() * remaining as f64;
                }
                None => unstarted_share += self.normalized_weight(*stage) * 100.0,
            }
        }
        if unstarted_share > 0.0 && self.percentage > 0.0 {
            let seconds_per_percent = self.observed.as_secs_f64() / self.percentage;
            seconds += seconds_per_percent * unstarted_share;
        }
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

/// `1h 02m 03s` style rendering for status lines.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs / 60) % 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stage: Stage, done: usize, total: usize, ms: u64) -> StageEvent {
        StageEvent {
            stage,
            images_done: done,
            images_total: total,
            elapsed: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_stage_keys() {
        assert_eq!(Stage::Fuse.key(), "fuse");
        assert_eq!(Stage::from_key("collapse"), Some(Stage::Collapse));
        assert_eq!(Stage::from_key("nope"), None);
        assert_eq!(event(Stage::Align, 1, 2, 0).stage_key(), "align");
    }

    #[test]
    fn test_weighted_percentage() {
        let mut model = ProgressModel::new(StageWeights::default());
        model.record(&event(Stage::Align, 5, 10, 100));
        assert!((model.overall_percentage() - 10.0).abs() < 1e-9);
        model.record(&event(Stage::Build, 10, 10, 100));
        assert!((model.overall_percentage() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentage_is_monotonic() {
        let mut model = ProgressModel::new(StageWeights::default());
        model.record(&event(Stage::Align, 4, 10, 10));
        let before = model.overall_percentage();
        model.record(&event(Stage::Align, 2, 10, 10));
        assert!(model.overall_percentage() >= before);
    }

    #[test]
    fn test_skipped_stage_is_renormalized() {
        let mut model = ProgressModel::new(StageWeights::default());
        model.begin_run(&[Stage::Build, Stage::Fuse, Stage::Collapse]);
        model.record(&event(Stage::Build, 1, 1, 10));
        assert!((model.overall_percentage() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_eta_reaches_zero() {
        let mut model = ProgressModel::new(StageWeights::default());
        assert_eq!(model.eta(), Duration::ZERO);

        let mut last = Duration::MAX;
        for stage in Stage::ALL {
            for done in 1..=4 {
                model.record(&event(stage, done, 4, 100));
                let eta = model.eta();
                assert!(eta <= last || done == 1);
                last = eta;
            }
        }
        assert!((model.overall_percentage() - 100.0).abs() < 1e-9);
        assert_eq!(model.eta(), Duration::ZERO);
    }

    #[test]
    fn test_eta_uses_history_mean() {
        let mut model = ProgressModel::new(StageWeights::default());
        model.begin_run(&[Stage::Build]);
        model.record(&event(Stage::Build, 1, 5, 1000));
        model.record(&event(Stage::Build, 2, 5, 3000));
        assert_eq!(model.eta(), Duration::from_secs(6));
    }

    #[test]
    fn test_channel_sink_forwards_events() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.on_event(&event(Stage::Fuse, 3, 3, 5));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.stage_key(), "fuse");
        assert!(received.is_stage_complete());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 05s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }
}
