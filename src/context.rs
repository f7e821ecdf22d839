//! Context-window scheduling for long video sequences.
//!
//! A motion module attends over a bounded number of frames at once. For
//! sequences longer than that capacity, sampling runs the temporal attention
//! over a schedule of overlapping index windows and blends the overlaps.
//! This module computes that schedule.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Windowing strategy over the frame sequence.
///
/// Only the uniform strategy exists today; the enum leaves room for
/// alternatives without changing the scheduler surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextSchedule {
    /// Evenly stepped windows with a fixed overlap.
    #[default]
    Uniform,
}

/// Invalid context configuration, rejected before any window is produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("context_length must be at least 1 (got {0})")]
    ContextLength(usize),
    #[error("context_overlap ({overlap}) must be smaller than context_length ({length})")]
    ContextOverlap { overlap: usize, length: usize },
    #[error("context_stride must be at least 1 (got {0})")]
    ContextStride(usize),
    #[error("video_length must be at least 1")]
    VideoLength,
}

/// Options controlling how a frame sequence is split into context windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextOptions {
    /// Maximum number of frames the motion module sees in one pass.
    pub context_length: usize,
    /// Temporal decimation factor; 1 keeps windows contiguous.
    pub context_stride: usize,
    /// Number of indices shared by consecutive windows.
    pub context_overlap: usize,
    /// Windowing strategy.
    pub schedule: ContextSchedule,
    /// Append a wrap-around window joining the sequence tail to its head.
    pub closed_loop: bool,
    /// Apply `context_stride` to the window-to-window step instead of
    /// decimating indices within each window. Expert option: full coverage of
    /// the sequence is no longer guaranteed.
    pub stride_as_step: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            context_length: 16,
            context_stride: 1,
            context_overlap: 4,
            schedule: ContextSchedule::Uniform,
            closed_loop: false,
            stride_as_step: false,
        }
    }
}

impl ContextOptions {
    /// Create options with the given window length and default stepping.
    pub fn new(context_length: usize) -> Self {
        Self {
            context_length,
            ..Default::default()
        }
    }

    /// Set the window-to-window overlap.
    pub fn with_overlap(mut self, context_overlap: usize) -> Self {
        self.context_overlap = context_overlap;
        self
    }

    /// Set the temporal decimation factor.
    pub fn with_stride(mut self, context_stride: usize) -> Self {
        self.context_stride = context_stride;
        self
    }

    /// Enable or disable the wrap-around window.
    pub fn with_closed_loop(mut self, closed_loop: bool) -> Self {
        self.closed_loop = closed_loop;
        self
    }

    /// Check the invariants between the fields.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.context_length < 1 {
            return Err(ConfigurationError::ContextLength(self.context_length));
        }
        if self.context_stride < 1 {
            return Err(ConfigurationError::ContextStride(self.context_stride));
        }
        if self.context_overlap >= self.context_length {
            return Err(ConfigurationError::ContextOverlap {
                overlap: self.context_overlap,
                length: self.context_length,
            });
        }
        Ok(())
    }
}

/// An ordered set of frame indices processed together by temporal attention.
///
/// Windows are produced fresh by the scheduler and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextWindow(Vec<usize>);

impl ContextWindow {
    /// The frame indices in processing order.
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Number of frames in the window.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the window holds no indices. The scheduler never emits one.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First index of the window.
    pub fn first(&self) -> Option<usize> {
        self.0.first().copied()
    }

    /// Last index of the window.
    pub fn last(&self) -> Option<usize> {
        self.0.last().copied()
    }
}

impl<'a> IntoIterator for &'a ContextWindow {
    type Item = &'a usize;
    type IntoIter = std::slice::Iter<'a, usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Context-window scheduler.
///
/// Materializes the full window schedule for a known `video_length` up front;
/// the sampling loop consumes the windows in order and blends the overlaps.
/// Every frame index in `[0, video_length)` is covered by at least one window
/// (except under [`ContextOptions::stride_as_step`]), and no window exceeds
/// `context_length` indices.
#[derive(Debug, Clone)]
pub struct ContextScheduler {
    video_length: usize,
    options: ContextOptions,
    windows: Vec<ContextWindow>,
}

impl ContextScheduler {
    /// Build the schedule for `video_length` frames.
    ///
    /// # Arguments
    /// * `video_length` - Total number of frames in the sequence
    /// * `options` - Windowing configuration
    pub fn new(video_length: usize, options: ContextOptions) -> Result<Self, ConfigurationError> {
        options.validate()?;
        if video_length < 1 {
            return Err(ConfigurationError::VideoLength);
        }

        let windows = match options.schedule {
            ContextSchedule::Uniform => uniform_windows(video_length, &options),
        };

        Ok(Self {
            video_length,
            options,
            windows,
        })
    }

    /// The scheduled windows, in processing order.
    pub fn windows(&self) -> &[ContextWindow] {
        &self.windows
    }

    /// Iterate over the scheduled windows.
    pub fn iter(&self) -> std::slice::Iter<'_, ContextWindow> {
        self.windows.iter()
    }

    /// Number of scheduled windows.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// A schedule always holds at least one window.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Total number of frames the schedule was built for.
    pub fn video_length(&self) -> usize {
        self.video_length
    }

    /// The configuration the schedule was built from.
    pub fn options(&self) -> &ContextOptions {
        &self.options
    }
}

/// Uniform schedule: evenly stepped windows, final window forced to end at
/// the last frame, optional wrap-around window for closed loops.
fn uniform_windows(video_length: usize, options: &ContextOptions) -> Vec<ContextWindow> {
    let length = options.context_length;

    // Entire sequence fits in one pass.
    if video_length <= length {
        return vec![ContextWindow((0..video_length).collect())];
    }

    let stride = options.context_stride;
    let mut windows = Vec::new();

    if options.stride_as_step {
        // Contiguous windows, stride widening the step between them.
        let step = (length - options.context_overlap) * stride;
        let mut start = 0;
        while start + length < video_length {
            windows.push(ContextWindow((start..start + length).collect()));
            start += step;
        }
        // Final window ends exactly at the last frame, shifting its start if
        // needed so no tail of fewer-than-requested frames is dropped.
        windows.push(ContextWindow((video_length - length..video_length).collect()));
    } else {
        // Each span of `length * stride` consecutive indices is covered by
        // `stride` phase-shifted windows of `length` decimated indices, so
        // decimation widens the receptive field without losing coverage.
        let span = length * stride;
        if video_length <= span {
            for phase in 0..stride {
                let mut indices: Vec<usize> = (phase..video_length).step_by(stride).collect();
                indices.truncate(length);
                if !indices.is_empty() {
                    windows.push(ContextWindow(indices));
                }
            }
        } else {
            let span_step = (length - options.context_overlap) * stride;
            let mut starts = Vec::new();
            let mut start = 0;
            while start + span < video_length {
                starts.push(start);
                start += span_step;
            }
            // Final span forced to end at the last frame.
            starts.push(video_length - span);
            for s in starts {
                for phase in 0..stride {
                    windows.push(ContextWindow((s + phase..s + span).step_by(stride).collect()));
                }
            }
        }
    }

    if options.closed_loop {
        windows.push(wrap_window(video_length, length));
    }

    windows
}

/// Wrap-around window joining the sequence tail to its head: the trailing
/// half of a window's worth of indices followed by the leading half.
fn wrap_window(video_length: usize, length: usize) -> ContextWindow {
    let len = length.min(video_length);
    let head = len / 2;
    let tail = len - head;

    let mut indices: Vec<usize> = (video_length - tail..video_length).collect();
    indices.extend(0..head);
    ContextWindow(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn covered(scheduler: &ContextScheduler) -> BTreeSet<usize> {
        scheduler
            .iter()
            .flat_map(|w| w.indices().iter().copied())
            .collect()
    }

    #[test]
    fn single_window_when_sequence_fits() {
        let scheduler = ContextScheduler::new(12, ContextOptions::new(16)).unwrap();
        assert_eq!(scheduler.len(), 1);
        let window = &scheduler.windows()[0];
        assert_eq!(window.indices(), (0..12).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn forty_frames_sixteen_length_four_overlap() {
        let options = ContextOptions::new(16).with_overlap(4);
        let scheduler = ContextScheduler::new(40, options).unwrap();

        let starts: Vec<usize> = scheduler.iter().map(|w| w.first().unwrap()).collect();
        assert_eq!(starts, vec![0, 12, 24]);
        assert_eq!(scheduler.windows().last().unwrap().last(), Some(39));

        let all = covered(&scheduler);
        assert_eq!(all, (0..40).collect::<BTreeSet<_>>());
    }

    #[test]
    fn full_coverage_across_configurations() {
        for video_length in [1, 5, 16, 17, 23, 40, 64, 100] {
            for (length, overlap) in [(16, 4), (16, 0), (8, 7), (4, 1)] {
                for stride in [1, 2, 3] {
                    let options = ContextOptions::new(length)
                        .with_overlap(overlap)
                        .with_stride(stride);
                    let scheduler = ContextScheduler::new(video_length, options).unwrap();
                    assert_eq!(
                        covered(&scheduler),
                        (0..video_length).collect::<BTreeSet<_>>(),
                        "gap in coverage for vl={video_length} len={length} ov={overlap} stride={stride}"
                    );
                }
            }
        }
    }

    #[test]
    fn windows_respect_length_bound_and_are_nonempty() {
        for video_length in [1, 9, 40, 77] {
            for stride in [1, 2, 4] {
                let options = ContextOptions::new(16).with_overlap(4).with_stride(stride);
                let scheduler = ContextScheduler::new(video_length, options).unwrap();
                for window in scheduler.iter() {
                    assert!(!window.is_empty());
                    assert!(window.len() <= 16);
                    for &idx in window {
                        assert!(idx < video_length);
                    }
                }
            }
        }
    }

    #[test]
    fn overlap_must_be_smaller_than_length() {
        let options = ContextOptions::new(16).with_overlap(16);
        let err = ContextScheduler::new(40, options).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::ContextOverlap {
                overlap: 16,
                length: 16
            }
        );
    }

    #[test]
    fn zero_length_stride_and_video_are_rejected() {
        assert!(matches!(
            ContextScheduler::new(40, ContextOptions::new(0)),
            Err(ConfigurationError::ContextLength(0))
        ));
        assert!(matches!(
            ContextScheduler::new(40, ContextOptions::new(16).with_stride(0)),
            Err(ConfigurationError::ContextStride(0))
        ));
        assert!(matches!(
            ContextScheduler::new(0, ContextOptions::new(16)),
            Err(ConfigurationError::VideoLength)
        ));
    }

    #[test]
    fn stride_decimates_within_windows() {
        let options = ContextOptions::new(4).with_overlap(1).with_stride(2);
        let scheduler = ContextScheduler::new(20, options).unwrap();

        // First span: phases 0 and 1 over indices 0..8.
        assert_eq!(scheduler.windows()[0].indices(), &[0, 2, 4, 6]);
        assert_eq!(scheduler.windows()[1].indices(), &[1, 3, 5, 7]);
        for window in scheduler.iter() {
            assert_eq!(window.len(), 4);
        }
    }

    #[test]
    fn stride_as_step_widens_the_step() {
        let options = ContextOptions {
            context_length: 8,
            context_overlap: 4,
            context_stride: 2,
            stride_as_step: true,
            ..Default::default()
        };
        let scheduler = ContextScheduler::new(40, options).unwrap();

        let starts: Vec<usize> = scheduler.iter().map(|w| w.first().unwrap()).collect();
        assert_eq!(starts, vec![0, 8, 16, 24, 32]);
        for window in scheduler.iter() {
            assert_eq!(window.len(), 8);
        }
    }

    #[test]
    fn closed_loop_appends_wrap_window() {
        let options = ContextOptions::new(16).with_overlap(4).with_closed_loop(true);
        let scheduler = ContextScheduler::new(40, options).unwrap();

        let wrap = scheduler.windows().last().unwrap();
        assert_eq!(wrap.len(), 16);
        assert_eq!(&wrap.indices()[..8], &[32, 33, 34, 35, 36, 37, 38, 39]);
        assert_eq!(&wrap.indices()[8..], &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn wrap_window_is_clamped_to_context_length() {
        let window = wrap_window(10, 16);
        assert_eq!(window.len(), 10);
        let window = wrap_window(100, 7);
        assert_eq!(window.len(), 7);
        assert_eq!(window.indices(), &[96, 97, 98, 99, 0, 1, 2]);
    }
}
