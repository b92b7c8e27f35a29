//! Counterpart position smoothing.
//!
//! Turns discrete position reports into continuous motion. A new sample
//! starts an animation from wherever the marker is *now* (possibly mid-way
//! through the previous animation) to the reported position, so jittery
//! arrival never produces a jump. The first sample is applied immediately.
//!
//! Pushed positions take precedence: a polled sample is ignored while the
//! latest pushed sample is younger than the push window, so a lagging server
//! record never drags the marker back.
//!
//! The smoother is read by the renderer and written by ride-client; it never
//! holds up a state merge.

use std::time::{Duration, Instant};

use ride_types::Coordinates;

/// Where a sample came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    /// Location topic push.
    Push,
    /// Ride snapshot from the poller.
    Poll,
}

/// One counterpart position report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    /// Reported position.
    pub position: Coordinates,
    /// Arrival time.
    pub timestamp: Instant,
    /// Origin of the report.
    pub source: SampleSource,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Animation {
    from: Coordinates,
    to: Coordinates,
    start: Instant,
}

/// Interpolates between the last two samples.
#[derive(Debug, Clone)]
pub struct LocationSmoother {
    duration: Duration,
    push_window: Duration,
    animation: Option<Animation>,
    last_sample: Option<LocationSample>,
    last_push: Option<Instant>,
}

impl LocationSmoother {
    /// Create a smoother with the given animation length.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            push_window: Duration::from_secs(6),
            animation: None,
            last_sample: None,
            last_push: None,
        }
    }

    /// How long a pushed sample outranks polled ones.
    pub fn with_push_window(mut self, window: Duration) -> Self {
        self.push_window = window;
        self
    }

    /// Feed a sample, in arrival order.
    ///
    /// Returns `false` when a polled sample was ignored in favour of a
    /// fresher push.
    pub fn push(&mut self, sample: LocationSample) -> bool {
        match sample.source {
            SampleSource::Push => self.last_push = Some(sample.timestamp),
            SampleSource::Poll => {
                if self.last_push.is_some_and(|at| {
                    sample.timestamp.saturating_duration_since(at) < self.push_window
                }) {
                    return false;
                }
            }
        }
        let start = sample.timestamp;
        let from = self.position_at(start).unwrap_or(sample.position);
        self.animation = Some(Animation {
            from,
            to: sample.position,
            start,
        });
        self.last_sample = Some(sample);
        true
    }

    /// Rendered position at `now`, or `None` before the first sample.
    pub fn position_at(&self, now: Instant) -> Option<Coordinates> {
        let animation = self.animation?;
        if self.duration.is_zero() {
            return Some(animation.to);
        }
        let elapsed = now.saturating_duration_since(animation.start);
        let t = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        Some(animation.from.lerp(&animation.to, t))
    }

    /// Whether an animation is still running at `now`.
    pub fn is_animating(&self, now: Instant) -> bool {
        match self.animation {
            Some(animation) => {
                animation.from != animation.to
                    && now.saturating_duration_since(animation.start) < self.duration
            }
            None => false,
        }
    }

    /// Frames of the current animation from `now` to its end, `step` apart.
    ///
    /// Always ends on the target position. Empty before the first sample.
    pub fn frames(&self, now: Instant, step: Duration) -> Vec<Coordinates> {
        let Some(animation) = self.animation else {
            return Vec::new();
        };
        let end = animation.start + self.duration;
        let mut frames = Vec::new();
        if !step.is_zero() {
            let mut at = now.max(animation.start);
            while at < end {
                if let Some(position) = self.position_at(at) {
                    frames.push(position);
                }
                at += step;
            }
        }
        frames.push(animation.to);
        frames
    }

    /// The most recent sample.
    pub fn last_sample(&self) -> Option<&LocationSample> {
        self.last_sample.as_ref()
    }

    /// Forget everything (ride ended).
    pub fn reset(&mut self) {
        self.animation = None;
        self.last_sample = None;
        self.last_push = None;
    }
}
