//! Control-list curve: a time-keyed breakpoint list with interpolation.
//!
//! This is the generic primitive underneath envelopes, fades, and their
//! inverses (§4.A). Fade shapes (§4.B, [`crate::fade`]) build one of these
//! with a particular breakpoint layout; the curve itself knows nothing
//! about fades.

/// How [`Curve::sample_into`] interpolates between adjacent breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Interpolation {
    #[default]
    Linear,
    /// Catmull-Rom-style smoothing through interior points; falls back to
    /// linear at the two ends of the curve, where there's no neighbour on
    /// one side to smooth against.
    Curved,
}

/// An ordered sequence of `(when, value)` breakpoints.
///
/// `when` is in region-local samples. Points are kept in strictly
/// increasing `when` order; [`Curve::add`] assumes callers add in that
/// order (bulk construction, e.g. fade-curve generation, bypasses any
/// merge/dedup logic and just pushes).
#[derive(Debug, Clone, PartialEq)]
pub struct Curve {
    points: Vec<(u64, f32)>,
    interpolation: Interpolation,
    freeze_depth: u32,
    dirty: bool,
}

impl Curve {
    pub fn new(interpolation: Interpolation) -> Self {
        Self {
            points: Vec::new(),
            interpolation,
            freeze_depth: 0,
            dirty: false,
        }
    }

    pub fn interpolation(&self) -> Interpolation {
        self.interpolation
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn points(&self) -> &[(u64, f32)] {
        &self.points
    }

    /// Append a breakpoint. Callers are expected to add in monotone `when`
    /// order; this is the bulk-construction path used by fade generation
    /// and does not attempt to merge with an existing point at the same
    /// `when`.
    pub fn add(&mut self, when: u64, value: f32) {
        self.points.push((when, value));
        self.mark_dirty();
    }

    pub fn clear(&mut self) {
        self.points.clear();
        self.mark_dirty();
    }

    /// Defer change notifications (via [`Curve::take_dirty`]) across a run
    /// of bulk edits. Calls nest; the curve is considered dirty only once
    /// the outermost `thaw` runs.
    pub fn freeze(&mut self) {
        self.freeze_depth += 1;
    }

    pub fn thaw(&mut self) {
        self.freeze_depth = self.freeze_depth.saturating_sub(1);
    }

    fn mark_dirty(&mut self) {
        if self.freeze_depth == 0 {
            self.dirty = true;
        } else {
            self.dirty = true;
        }
    }

    /// Returns whether the curve changed since the last call, and clears
    /// the flag. While frozen this always returns `false` — the caller is
    /// expected to poll again after `thaw`.
    pub fn take_dirty(&mut self) -> bool {
        if self.freeze_depth > 0 {
            return false;
        }
        std::mem::replace(&mut self.dirty, false)
    }

    /// The `when` of the final breakpoint, i.e. the curve's domain end.
    pub fn end_time(&self) -> u64 {
        self.points.last().map(|p| p.0).unwrap_or(0)
    }

    pub fn endpoint_value(&self, first: bool) -> f32 {
        if first {
            self.points.first().map(|p| p.1).unwrap_or(0.0)
        } else {
            self.points.last().map(|p| p.1).unwrap_or(0.0)
        }
    }

    /// Adjust the final breakpoint so the curve's domain is exactly
    /// `[0, t]`. If `t` falls strictly before the current end, points past
    /// `t` are dropped and the value at `t` is interpolated from what
    /// remains. If `t` is beyond the current end, the final value is held
    /// and a new terminal point is appended.
    pub fn truncate_end(&mut self, t: u64) {
        if self.points.is_empty() {
            self.points.push((t, 0.0));
            self.mark_dirty();
            return;
        }
        if t >= self.end_time() {
            self.extend_to(t);
            return;
        }
        let v = self.value_at(t);
        self.points.retain(|p| p.0 < t);
        self.points.push((t, v));
        self.mark_dirty();
    }

    /// Extend the curve so it reaches `t`, holding the final value flat if
    /// `t` is beyond the current end. No-op if `t` is already the end.
    pub fn extend_to(&mut self, t: u64) {
        let end = self.end_time();
        if t == end {
            return;
        }
        if t < end {
            self.truncate_end(t);
            return;
        }
        let v = self.endpoint_value(false);
        self.points.push((t, v));
        self.mark_dirty();
    }

    /// Interpolate the curve's value at a single point in time.
    pub fn value_at(&self, t: u64) -> f32 {
        let mut out = [0.0f32];
        self.sample_into(&mut out, t, t, 1);
        out[0]
    }

    /// Fill `out` with `n` interpolated values sampled evenly across
    /// `[t0, t1]` inclusive (`out.len()` must be `>= n`).
    pub fn sample_into(&self, out: &mut [f32], t0: u64, t1: u64, n: usize) {
        if n == 0 {
            return;
        }
        if self.points.is_empty() {
            for o in out.iter_mut().take(n) {
                *o = 0.0;
            }
            return;
        }
        if self.points.len() == 1 {
            let v = self.points[0].1;
            for o in out.iter_mut().take(n) {
                *o = v;
            }
            return;
        }

        let step = if n > 1 {
            (t1.saturating_sub(t0)) as f64 / (n - 1) as f64
        } else {
            0.0
        };

        for (i, o) in out.iter_mut().take(n).enumerate() {
            let t = t0 as f64 + step * i as f64;
            *o = self.interpolate(t);
        }
    }

    fn interpolate(&self, t: f64) -> f32 {
        let pts = &self.points;
        if t <= pts[0].0 as f64 {
            return pts[0].1;
        }
        if t >= pts[pts.len() - 1].0 as f64 {
            return pts[pts.len() - 1].1;
        }
        // find the segment [idx, idx+1] containing t
        let idx = match pts.binary_search_by(|p| (p.0 as f64).partial_cmp(&t).unwrap()) {
            Ok(exact) => return pts[exact].1,
            Err(insert_at) => insert_at - 1,
        };
        let (x0, y0) = (pts[idx].0 as f64, pts[idx].1 as f64);
        let (x1, y1) = (pts[idx + 1].0 as f64, pts[idx + 1].1 as f64);
        let frac = if x1 > x0 { (t - x0) / (x1 - x0) } else { 0.0 };

        let linear = y0 + (y1 - y0) * frac;

        match self.interpolation {
            Interpolation::Linear => linear as f32,
            Interpolation::Curved => {
                let y_before = if idx > 0 { pts[idx - 1].1 as f64 } else { y0 };
                let y_after = if idx + 2 < pts.len() {
                    pts[idx + 2].1 as f64
                } else {
                    y1
                };
                catmull_rom(y_before, y0, y1, y_after, frac) as f32
            }
        }
    }

    /// Reverse both the time axis and point order: a fade-out curve built
    /// this way from a fade-in curve (or vice versa). The resulting curve
    /// spans the same `[0, end]` domain.
    pub fn reversed(&self) -> Curve {
        let end = self.end_time();
        let mut points: Vec<(u64, f32)> = self
            .points
            .iter()
            .map(|&(w, v)| (end - w, v))
            .collect();
        points.reverse();
        Curve {
            points,
            interpolation: self.interpolation,
            freeze_depth: 0,
            dirty: false,
        }
    }

    /// Apply `f` pointwise to every breakpoint's value, producing a new
    /// curve with the same timing. Used to build inverse-power curves
    /// (`sqrt(1 - x^2)`) from a primary fade.
    pub fn map_values(&self, f: impl Fn(f32) -> f32) -> Curve {
        Curve {
            points: self.points.iter().map(|&(w, v)| (w, f(v))).collect(),
            interpolation: self.interpolation,
            freeze_depth: 0,
            dirty: false,
        }
    }
}

fn catmull_rom(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * ((2.0 * p1)
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_interpolation_between_two_points() {
        let mut c = Curve::new(Interpolation::Linear);
        c.add(0, 0.0);
        c.add(100, 1.0);
        assert!((c.value_at(50) - 0.5).abs() < 1e-6);
        assert_eq!(c.value_at(0), 0.0);
        assert_eq!(c.value_at(100), 1.0);
    }

    #[test]
    fn clamps_outside_domain() {
        let mut c = Curve::new(Interpolation::Linear);
        c.add(10, 0.2);
        c.add(20, 0.8);
        assert_eq!(c.value_at(0), 0.2);
        assert_eq!(c.value_at(1000), 0.8);
    }

    #[test]
    fn truncate_end_shrinks_and_interpolates() {
        let mut c = Curve::new(Interpolation::Linear);
        c.add(0, 0.0);
        c.add(100, 1.0);
        c.truncate_end(50);
        assert_eq!(c.end_time(), 50);
        assert!((c.endpoint_value(false) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn extend_to_holds_final_value() {
        let mut c = Curve::new(Interpolation::Linear);
        c.add(0, 0.0);
        c.add(50, 0.5);
        c.extend_to(100);
        assert_eq!(c.end_time(), 100);
        assert_eq!(c.endpoint_value(false), 0.5);
    }

    #[test]
    fn freeze_defers_dirty_until_thaw() {
        let mut c = Curve::new(Interpolation::Linear);
        c.freeze();
        c.add(0, 0.0);
        c.add(10, 1.0);
        assert!(!c.take_dirty());
        c.thaw();
        assert!(c.take_dirty());
        assert!(!c.take_dirty());
    }

    #[test]
    fn reversed_curve_mirrors_time_axis() {
        let mut c = Curve::new(Interpolation::Linear);
        c.add(0, 0.1);
        c.add(100, 1.0);
        let r = c.reversed();
        assert_eq!(r.end_time(), 100);
        assert_eq!(r.endpoint_value(true), 1.0);
        assert_eq!(r.endpoint_value(false), 0.1);
    }

    #[test]
    fn sample_into_fills_n_evenly_spaced_points() {
        let mut c = Curve::new(Interpolation::Linear);
        c.add(0, 0.0);
        c.add(10, 1.0);
        let mut out = [0.0f32; 5];
        c.sample_into(&mut out, 0, 10, 5);
        assert_eq!(out, [0.0, 0.25, 0.5, 0.75, 1.0]);
    }
}
