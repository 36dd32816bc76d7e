//! Persisted-state codec (§6, §10.D).
//!
//! [`RegionState`] is the serialisable shape of everything about a region
//! that survives a save/reload round trip: channel count, scale amplitude,
//! and the five curves (envelope, fade-in/out, inverse fade-in/out). The
//! embedding document owns the surrounding container format; this crate
//! only owns the shape below that point and its TOML rendering.

use serde::{Deserialize, Serialize};

use crate::curve::{Curve, Interpolation};
use crate::error::{RegionError, Result};

/// One curve child node: either "use the session default" or an explicit
/// breakpoint list, plus whether it's currently active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveState {
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub points: Vec<(u64, f32)>,
}

impl CurveState {
    pub fn from_curve(curve: &Curve, active: bool, is_default: bool) -> Self {
        Self {
            default: is_default,
            active,
            points: curve.points().to_vec(),
        }
    }

    pub fn to_curve(&self, interpolation: Interpolation) -> Curve {
        let mut c = Curve::new(interpolation);
        for &(when, value) in &self.points {
            c.add(when, value);
        }
        c
    }
}

/// The persisted shape of a region's gain/envelope/fade state. Attributes
/// `channels` and `scale_gain` map 1:1 onto §6's document; the curve
/// children are named for their §6 role, with `inverse_fade_in`/
/// `inverse_fade_out` accepting both the historical and modern field names
/// on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionState {
    pub channels: u16,
    pub scale_gain: f32,

    pub envelope: CurveState,
    pub fade_in: CurveState,
    pub fade_out: CurveState,

    #[serde(alias = "inv_fade_in")]
    pub inverse_fade_in: Option<CurveState>,
    #[serde(alias = "inv_fade_out")]
    pub inverse_fade_out: Option<CurveState>,
}

impl RegionState {
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RegionError::InvalidState(e.to_string()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| RegionError::InvalidState(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> RegionState {
        RegionState {
            channels: 2,
            scale_gain: 0.8,
            envelope: CurveState { default: true, active: false, points: vec![] },
            fade_in: CurveState { default: false, active: true, points: vec![(0, 0.0), (64, 1.0)] },
            fade_out: CurveState { default: true, active: true, points: vec![] },
            inverse_fade_in: Some(CurveState { default: false, active: true, points: vec![(0, 1.0), (64, 0.0)] }),
            inverse_fade_out: None,
        }
    }

    #[test]
    fn round_trips_through_toml() {
        let state = sample_state();
        let text = state.to_toml_string().unwrap();
        let back = RegionState::from_toml_str(&text).unwrap();
        assert_eq!(back.channels, 2);
        assert_eq!(back.fade_in.points, vec![(0, 0.0), (64, 1.0)]);
        assert!(back.inverse_fade_out.is_none());
    }

    #[test]
    fn historical_inv_fade_field_names_are_accepted() {
        let text = r#"
            channels = 1
            scale_gain = 1.0

            [envelope]
            default = true
            active = false

            [fade_in]
            default = true
            active = false

            [fade_out]
            default = true
            active = false

            [inv_fade_in]
            default = false
            active = true
            points = [[0, 1.0], [100, 0.0]]
        "#;
        let state = RegionState::from_toml_str(text).unwrap();
        let inv = state.inverse_fade_in.expect("inv_fade_in alias should populate inverse_fade_in");
        assert_eq!(inv.points, vec![(0, 1.0), (100, 0.0)]);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(RegionState::from_toml_str("channels = [not valid").is_err());
    }

    #[test]
    fn curve_state_round_trips_through_curve() {
        let mut c = Curve::new(Interpolation::Linear);
        c.add(0, 0.0);
        c.add(50, 1.0);
        let state = CurveState::from_curve(&c, true, false);
        let back = state.to_curve(Interpolation::Linear);
        assert_eq!(back.points(), c.points());
    }
}
