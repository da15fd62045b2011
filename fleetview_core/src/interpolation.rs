//! Marker interpolation - turns 1 Hz position samples into continuous motion.
//!
//! Each marker is a small state machine (`Idle → Animating → Idle`). A new
//! target starts an animation from the marker's *currently rendered*
//! position, with a cubic ease-out over a clamped duration. At most one
//! animation per marker exists; a newer target replaces the one in flight.
//!
//! Everything here is driven by an explicit `now: Duration` (monotonic), so
//! the same code runs under a real frame clock or a simulated one.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::InterpolationConfig;
use crate::location::{LatLng, LocationRecord};

/// Cubic ease-out: fast start, gentle arrival.
pub fn ease_out_cubic(progress: f64) -> f64 {
    1.0 - (1.0 - progress).powi(3)
}

/// Animation length for a move of `distance_deg`.
///
/// With a non-zero velocity hint (degrees/second) the marker takes as long as
/// the vehicle would; without one, the distance is scaled directly. Either
/// way the result lies in `[min_duration, max_duration]`.
pub fn compute_duration(distance_deg: f64, velocity: Option<f64>, config: &InterpolationConfig) -> Duration {
    let min_ms = config.min_duration.as_secs_f64() * 1000.0;
    let max_ms = config.max_duration.as_secs_f64() * 1000.0;

    let raw_ms = match velocity {
        Some(v) if v.is_finite() && v != 0.0 => distance_deg / v.abs() * config.velocity_scale_ms,
        _ => distance_deg * config.distance_scale_ms,
    };

    // f64::clamp panics on inverted bounds
    let (lo, hi) = if min_ms <= max_ms { (min_ms, max_ms) } else { (max_ms, min_ms) };
    let ms = if raw_ms.is_nan() { lo } else { raw_ms.clamp(lo, hi) };
    Duration::from_secs_f64(ms / 1000.0)
}

/// One in-flight animation.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolation {
    pub start: LatLng,
    pub target: LatLng,
    pub started_at: Duration,
    pub duration: Duration,
    pub velocity: Option<f64>,
}

impl Interpolation {
    /// Linear progress in `[0, 1]`.
    pub fn progress(&self, now: Duration) -> f64 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_sub(self.started_at).as_secs_f64();
        (elapsed / self.duration.as_secs_f64()).min(1.0)
    }

    /// Eased position; exactly `target` once progress reaches 1.
    pub fn position_at(&self, now: Duration) -> LatLng {
        let progress = self.progress(now);
        if progress >= 1.0 {
            self.target
        } else {
            self.start.lerp(&self.target, ease_out_cubic(progress))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerPhase {
    Idle,
    Animating(Interpolation),
}

/// What happened to a new target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetOutcome {
    /// Failed the validity predicate; the marker holds its position
    Rejected,
    /// Idle marker updated again inside the throttle window
    Throttled,
    /// First position for this marker; drawn immediately
    Placed(LatLng),
    /// Target equals where the marker already is (or is already heading)
    Unchanged,
    /// Animation started; `superseded` if one was cancelled to make room
    Started { duration: Duration, superseded: bool },
}

/// A rendered marker and its animation state.
#[derive(Debug, Clone)]
pub struct Marker {
    rendered: Option<LatLng>,
    phase: MarkerPhase,
    last_applied_at: Option<Duration>,
}

impl Default for Marker {
    fn default() -> Self {
        Self::new()
    }
}

impl Marker {
    pub fn new() -> Self {
        Self {
            rendered: None,
            phase: MarkerPhase::Idle,
            last_applied_at: None,
        }
    }

    pub fn rendered(&self) -> Option<LatLng> {
        self.rendered
    }

    pub fn phase(&self) -> &MarkerPhase {
        &self.phase
    }

    pub fn is_animating(&self) -> bool {
        matches!(self.phase, MarkerPhase::Animating(_))
    }

    /// Where the marker is heading, or resting if idle.
    pub fn destination(&self) -> Option<LatLng> {
        match &self.phase {
            MarkerPhase::Animating(anim) => Some(anim.target),
            MarkerPhase::Idle => self.rendered,
        }
    }

    /// Points the marker at a new position.
    pub fn set_target(
        &mut self,
        target: LatLng,
        velocity: Option<f64>,
        now: Duration,
        config: &InterpolationConfig,
    ) -> TargetOutcome {
        if !target.is_valid() {
            return TargetOutcome::Rejected;
        }

        let Some(rendered) = self.rendered else {
            self.rendered = Some(target);
            self.phase = MarkerPhase::Idle;
            self.last_applied_at = Some(now);
            return TargetOutcome::Placed(target);
        };

        let in_flight = match &self.phase {
            MarkerPhase::Animating(anim) => Some(anim.clone()),
            MarkerPhase::Idle => None,
        };

        // Repeats of the current destination leave the throttle window alone
        let destination = in_flight.as_ref().map_or(rendered, |anim| anim.target);
        if destination == target {
            return TargetOutcome::Unchanged;
        }

        if in_flight.is_none() {
            if let Some(last) = self.last_applied_at {
                if now.saturating_sub(last) < config.throttle_window {
                    return TargetOutcome::Throttled;
                }
            }
        }

        // Start from where the marker is drawn right now, not from the
        // previous logical target.
        let current = match &in_flight {
            Some(anim) => anim.position_at(now),
            None => rendered,
        };
        self.rendered = Some(current);

        if current == target {
            self.phase = MarkerPhase::Idle;
            return TargetOutcome::Unchanged;
        }

        let duration = compute_duration(current.distance_deg(&target), velocity, config);
        self.phase = MarkerPhase::Animating(Interpolation {
            start: current,
            target,
            started_at: now,
            duration,
            velocity,
        });
        self.last_applied_at = Some(now);

        TargetOutcome::Started {
            duration,
            superseded: in_flight.is_some(),
        }
    }

    /// Advances the animation; returns the position to draw if it moved.
    pub fn tick(&mut self, now: Duration) -> Option<LatLng> {
        let MarkerPhase::Animating(anim) = &self.phase else {
            return None;
        };

        if anim.progress(now) >= 1.0 {
            let target = anim.target;
            self.rendered = Some(target);
            self.phase = MarkerPhase::Idle;
            return Some(target);
        }

        let position = anim.position_at(now);
        self.rendered = Some(position);
        Some(position)
    }

    /// Drops any in-flight animation, freezing the marker where it is drawn.
    pub fn cancel(&mut self, now: Duration) {
        if let MarkerPhase::Animating(anim) = &self.phase {
            self.rendered = Some(anim.position_at(now));
            self.phase = MarkerPhase::Idle;
        }
    }
}

/// All markers on the map, keyed by vehicle id.
pub struct InterpolationScheduler {
    markers: HashMap<String, Marker>,
    config: InterpolationConfig,
}

impl InterpolationScheduler {
    pub fn new(config: InterpolationConfig) -> Self {
        Self {
            markers: HashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &InterpolationConfig {
        &self.config
    }

    /// Gives one marker a new target.
    pub fn set_target(&mut self, vehicle_id: &str, target: LatLng, velocity: Option<f64>, now: Duration) -> TargetOutcome {
        if !target.is_valid() {
            return TargetOutcome::Rejected;
        }
        let marker = self.markers.entry(vehicle_id.to_string()).or_default();
        marker.set_target(target, velocity, now, &self.config)
    }

    /// Feeds a published location list into the markers.
    pub fn apply<'a, I>(&mut self, records: I, now: Duration) -> Vec<(String, TargetOutcome)>
    where
        I: IntoIterator<Item = &'a LocationRecord>,
    {
        records
            .into_iter()
            .map(|record| {
                let outcome = match record.position() {
                    Some(target) => self.set_target(&record.vehicle_id, target, record.velocity_magnitude(), now),
                    None => TargetOutcome::Rejected,
                };
                (record.vehicle_id.clone(), outcome)
            })
            .collect()
    }

    /// Advances every animating marker; returns the positions to redraw.
    pub fn tick(&mut self, now: Duration) -> Vec<(String, LatLng)> {
        self.markers
            .iter_mut()
            .filter_map(|(id, marker)| marker.tick(now).map(|pos| (id.clone(), pos)))
            .collect()
    }

    /// True while any marker is animating.
    pub fn is_active(&self) -> bool {
        self.markers.values().any(Marker::is_animating)
    }

    pub fn active_count(&self) -> usize {
        self.markers.values().filter(|m| m.is_animating()).count()
    }

    pub fn rendered(&self, vehicle_id: &str) -> Option<LatLng> {
        self.markers.get(vehicle_id).and_then(Marker::rendered)
    }

    pub fn destination(&self, vehicle_id: &str) -> Option<LatLng> {
        self.markers.get(vehicle_id).and_then(Marker::destination)
    }

    pub fn marker(&self, vehicle_id: &str) -> Option<&Marker> {
        self.markers.get(vehicle_id)
    }

    /// Stops one marker's animation where it currently is.
    pub fn cancel(&mut self, vehicle_id: &str, now: Duration) {
        if let Some(marker) = self.markers.get_mut(vehicle_id) {
            marker.cancel(now);
        }
    }

    pub fn remove(&mut self, vehicle_id: &str) -> Option<Marker> {
        self.markers.remove(vehicle_id)
    }

    /// Vehicle ids with a marker.
    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.markers.keys()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}
