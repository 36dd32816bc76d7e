//! Fade curve construction from shape parameters (§4.A, §4.B).
//!
//! [`Curve`](crate::curve::Curve) is the generic breakpoint primitive; this
//! module knows how to lay breakpoints out for each [`FadeShape`] and how to
//! derive the paired inverse curve a crossfade caller uses to attenuate the
//! material beneath this region.

use serde::{Deserialize, Serialize};

use crate::curve::{Curve, Interpolation};

/// Fade endpoints deliberately avoid exact zero so logarithmic (dB)
/// rendering of the curve stays well defined.
pub const GAIN_SMALL: f32 = 0.00001;

const GAIN_UNITY: f32 = 1.0;
const BUILD_STEPS: usize = 32;

/// Shape parameter for [`build_fade_in`] / [`build_fade_out`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FadeShape {
    #[default]
    Linear,
    Fast,
    Slow,
    ConstantPower,
    Symmetric,
}

/// Exposed for [`crate::region::Region::normalize`], which needs the same
/// dB-to-linear conversion this module already builds fades out of.
pub(crate) fn db_to_coefficient(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

fn coefficient_to_db(coeff: f32) -> f32 {
    20.0 * coeff.max(GAIN_SMALL).log10()
}

/// A geometric dB-ramp from unity down to `GAIN_SMALL` over `num_steps`
/// breakpoints, losing `db_drop` decibels total. This is the building block
/// shared by `Fast` (one ramp) and `Slow` (two ramps, merged).
fn db_fade(len: u64, num_steps: usize, db_drop: f32) -> Curve {
    let mut c = Curve::new(Interpolation::Curved);
    c.add(0, GAIN_UNITY);

    let fade_speed = db_to_coefficient(db_drop / num_steps as f32);
    let mut coeff = GAIN_UNITY;
    for i in 1..num_steps.saturating_sub(1) {
        coeff *= fade_speed;
        let when = (len as f64 * i as f64 / num_steps as f64) as u64;
        c.add(when, coeff);
    }
    c.add(len, GAIN_SMALL);
    c
}

/// Blend two equal-length curves in the dB domain: `v1*(1-k/N) + v2*(k/N)`
/// at each matching breakpoint index, converted back to linear gain.
fn merge_curves(curve1: &Curve, curve2: &Curve) -> Curve {
    let mut out = Curve::new(Interpolation::Curved);
    let n = curve1.points().len();
    if n != curve2.points().len() {
        return curve1.clone();
    }
    for (count, (&(when, v1), &(_, v2))) in curve1
        .points()
        .iter()
        .zip(curve2.points().iter())
        .enumerate()
    {
        let db1 = coefficient_to_db(v1);
        let db2 = coefficient_to_db(v2);
        let frac = count as f64 / n as f64;
        let interp_db = db1 as f64 * (1.0 - frac) + db2 as f64 * frac;
        out.add(when, db_to_coefficient(interp_db as f32));
    }
    out
}

/// `sqrt(1 - x^2)` applied pointwise — the equal-power inverse of a primary
/// fade curve, used when no explicit inverse curve shape is requested.
fn inverse_power_curve(src: &Curve) -> Curve {
    src.map_values(|v| (1.0 - v * v).max(0.0).sqrt())
}

/// Build a fade-in curve of the given shape and length, along with its
/// paired inverse. Breakpoint `when` values are region-local samples in
/// `[0, len]`.
pub fn build_fade_in(shape: FadeShape, len: u64) -> (Curve, Curve) {
    let mut fade = Curve::new(Interpolation::Curved);
    let inverse;

    match shape {
        FadeShape::Linear => {
            fade.add(0, GAIN_SMALL);
            fade.add(len, GAIN_UNITY);
            inverse = fade.reversed();
        }
        FadeShape::Fast => {
            let out_shape = db_fade(len, BUILD_STEPS, -60.0);
            fade = out_shape.reversed();
            inverse = inverse_power_curve(&fade);
        }
        FadeShape::Slow => {
            let slow = db_fade(len, BUILD_STEPS, -1.0);
            let fast = db_fade(len, BUILD_STEPS, -80.0);
            let merged = merge_curves(&slow, &fast);
            fade = merged.reversed();
            inverse = inverse_power_curve(&fade);
        }
        FadeShape::ConstantPower => {
            fade.add(0, GAIN_SMALL);
            for i in 1..BUILD_STEPS {
                let dist = i as f64 / (BUILD_STEPS + 1) as f64;
                let when = (len as f64 * dist) as u64;
                fade.add(when, (dist * std::f64::consts::FRAC_PI_2).sin() as f32);
            }
            fade.add(len, GAIN_UNITY);
            inverse = fade.reversed();
        }
        FadeShape::Symmetric => {
            fade.add(0, GAIN_UNITY);
            fade.add(len / 2, 0.6);
            let breakpoint = 0.7f64;
            for i in 2..9 {
                let coeff = (1.0 - breakpoint) * 0.5f64.powi(i);
                let when =
                    (len as f64 * (breakpoint + (1.0 - breakpoint) * i as f64 / 9.0)) as u64;
                fade.add(when, coeff as f32);
            }
            fade.add(len, GAIN_SMALL);
            let reversed = fade.reversed();
            fade = reversed;
            inverse = fade.reversed();
        }
    }

    (fade, inverse)
}

/// Build a fade-out curve, mirroring [`build_fade_in`]'s shape handling.
pub fn build_fade_out(shape: FadeShape, len: u64) -> (Curve, Curve) {
    let mut fade = Curve::new(Interpolation::Curved);
    let inverse;

    match shape {
        FadeShape::Linear => {
            fade.add(0, GAIN_UNITY);
            fade.add(len, GAIN_SMALL);
            inverse = fade.reversed();
        }
        FadeShape::Fast => {
            fade = db_fade(len, BUILD_STEPS, -60.0);
            inverse = inverse_power_curve(&fade);
        }
        FadeShape::Slow => {
            let slow = db_fade(len, BUILD_STEPS, -1.0);
            let fast = db_fade(len, BUILD_STEPS, -80.0);
            fade = merge_curves(&slow, &fast);
            inverse = inverse_power_curve(&fade);
        }
        FadeShape::ConstantPower => {
            fade.add(0, GAIN_UNITY);
            for i in 1..BUILD_STEPS {
                let dist = i as f64 / (BUILD_STEPS + 1) as f64;
                let when = (len as f64 * dist) as u64;
                fade.add(when, (dist * std::f64::consts::FRAC_PI_2).cos() as f32);
            }
            fade.add(len, GAIN_SMALL);
            inverse = fade.reversed();
        }
        FadeShape::Symmetric => {
            fade.add(0, GAIN_UNITY);
            fade.add(len / 2, 0.6);
            let breakpoint = 0.7f64;
            for i in 2..9 {
                let coeff = (1.0 - breakpoint) * 0.5f64.powi(i);
                let when =
                    (len as f64 * (breakpoint + (1.0 - breakpoint) * i as f64 / 9.0)) as u64;
                fade.add(when, coeff as f32);
            }
            fade.add(len, GAIN_SMALL);
            inverse = fade.reversed();
        }
    }

    (fade, inverse)
}
