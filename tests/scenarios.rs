//! Scenario-level tests for the region read-at-position engine, against the
//! public crate API, mirroring the numbered scenarios a region's read path
//! must satisfy.

use std::sync::Arc;

use region_engine::config::EngineDefaults;
use region_engine::fade::{FadeShape, GAIN_SMALL};
use region_engine::plugin::Plugin;
use region_engine::region::Region;
use region_engine::source::Source;

struct RampSource {
    samples: Vec<f32>,
}

impl Source for RampSource {
    fn sample_rate(&self) -> u32 {
        44_100
    }
    fn length(&self) -> u64 {
        self.samples.len() as u64
    }
    fn read(&self, buf: &mut [f32], offset: u64, count: usize) -> usize {
        let offset = offset as usize;
        if offset >= self.samples.len() {
            return 0;
        }
        let available = (self.samples.len() - offset).min(count);
        buf[..available].copy_from_slice(&self.samples[offset..offset + available]);
        available
    }
    fn read_peaks(&self, _: &mut [(f32, f32)], _: usize, _: u64, _: u64, _: u64) -> bool {
        false
    }
}

fn mono_region(samples: Vec<f32>) -> Region {
    let src: Arc<dyn Source> = Arc::new(RampSource { samples: samples.clone() });
    let master: Arc<dyn Source> = Arc::new(RampSource { samples });
    Region::new(0, 1000, 0, vec![src], vec![master], EngineDefaults::default())
}

/// Scenario 1: region of 1000 samples, scale 0.5, no fades, opaque.
#[test]
fn scenario_1_scaled_opaque_no_fades() {
    let samples: Vec<f32> = (0..1000).map(|i| i as f32).collect();
    let region = mono_region(samples.clone());
    region.set_scale_amplitude(0.5);

    let mut buf = vec![0.0; 1000];
    let mut mix = Vec::new();
    let mut gain = Vec::new();
    let n = region.read_at(&mut buf, &mut mix, &mut gain, 0, 1000, 0);

    assert_eq!(n, 1000);
    for i in 0..1000 {
        assert!((buf[i] - 0.5 * samples[i]).abs() < 1e-3, "i={i}");
    }
}

/// Scenario 2: linear fade-in/out of 100 on top of scenario 1.
#[test]
fn scenario_2_linear_fade_in_and_out() {
    let samples: Vec<f32> = vec![1.0; 1000];
    let region = mono_region(samples);
    region.set_scale_amplitude(0.5);
    region.set_fade_in_active(true);
    region.set_fade_out_active(true);
    region.set_fade_in(FadeShape::Linear, 100);
    region.set_fade_out(FadeShape::Linear, 100);

    let mut buf = vec![0.0; 1000];
    let mut mix = Vec::new();
    let mut gain = Vec::new();
    let n = region.read_at(&mut buf, &mut mix, &mut gain, 0, 1000, 0);

    assert_eq!(n, 1000);
    assert!((buf[0] - GAIN_SMALL * 0.5).abs() < 1e-5);
    assert!((buf[999] - GAIN_SMALL * 0.5).abs() < 1e-4);
    assert!((buf[500] - 0.5).abs() < 1e-5);
}

/// Scenario 3: two-channel region with a plugin chain; the second channel's
/// read at the same window must be a cache hit (no further source read) and
/// both channels must observe the same plugin-shifted output.
#[test]
fn scenario_3_cache_hit_aligns_both_channels_with_plugin_latency() {
    struct DelayPlugin {
        latency: u32,
    }
    impl Plugin for DelayPlugin {
        fn can_support_io(&self, _n_in: u16, _n_out: u16) -> bool {
            true
        }
        fn configure_io(&mut self, _n_in: u16, _n_out: u16) -> bool {
            true
        }
        fn required_buffers(&self) -> u16 {
            2
        }
        fn set_block_size(&mut self, _n: usize) {}
        fn effective_latency(&self) -> u32 {
            self.latency
        }
        fn effective_tailtime(&self) -> u32 {
            0
        }
        fn run(
            &mut self,
            bufs: &mut [Vec<f32>],
            _cycle_start: i64,
            _cycle_end: i64,
            _region_pos: i64,
            _n_samples: usize,
            _offset: usize,
        ) -> bool {
            for buf in bufs.iter_mut() {
                for s in buf.iter_mut() {
                    *s += 1.0;
                }
            }
            true
        }
        fn flush(&mut self) {}
    }

    let samples: Vec<f32> = (0..1000).map(|i| i as f32).collect();
    let src_l: Arc<dyn Source> = Arc::new(RampSource { samples: samples.clone() });
    let src_r: Arc<dyn Source> = Arc::new(RampSource { samples: samples.clone() });
    let region = Region::new(
        0,
        1000,
        0,
        vec![src_l.clone(), src_r.clone()],
        vec![src_l, src_r],
        EngineDefaults::default(),
    );
    region.add_plugin(Box::new(DelayPlugin { latency: 32 })).unwrap();

    let mut buf0 = vec![0.0; 100];
    let mut mix = Vec::new();
    let mut gain = Vec::new();
    let n0 = region.read_at(&mut buf0, &mut mix, &mut gain, 0, 100, 0);

    let mut buf1 = vec![0.0; 100];
    let n1 = region.read_at(&mut buf1, &mut mix, &mut gain, 0, 100, 1);

    assert_eq!(n0, 100);
    assert_eq!(n1, 100);
    assert_eq!(buf0, buf1, "both channels must observe identical plugin-aligned output");
}

/// Scenario 4: non-opaque region with fade-in 50 mixes additively, never
/// attenuating the caller's existing buffer content.
#[test]
fn scenario_4_non_opaque_fade_in_is_purely_additive() {
    let samples: Vec<f32> = vec![1.0; 1000];
    let region = mono_region(samples);
    region.set_opaque(false);
    region.set_fade_in_active(true);
    region.set_fade_in(FadeShape::Linear, 50);

    let mut buf = vec![1.0; 1000];
    let mut mix = Vec::new();
    let mut gain = Vec::new();
    region.read_at(&mut buf, &mut mix, &mut gain, 0, 1000, 0);

    assert!(buf[0] >= 1.0, "non-opaque fade-in must not attenuate existing content");
    assert!((buf[500] - 2.0).abs() < 1e-4, "body is additive: 1.0 existing + 1.0 mix");
}

/// Scenario 5: inverse-fade crossfade — an opaque region with an explicit
/// `inverse_fade_in` pre-attenuates existing buffer content by the inverse
/// curve before adding its own fade-in-gated material.
#[test]
fn scenario_5_inverse_fade_crossfade() {
    let samples: Vec<f32> = vec![1.0; 1000];
    let region = mono_region(samples);
    region.set_fade_in_active(true);
    region.set_fade_in(FadeShape::ConstantPower, 100);

    let mut buf = vec![1.0; 1000];
    let mut mix = Vec::new();
    let mut gain = Vec::new();
    region.read_at(&mut buf, &mut mix, &mut gain, 0, 1000, 0);

    // constant-power fade-in ships with an explicit inverse per §4.A; the
    // equal-power property (fade^2 + inverse^2 ~= 1) should hold well within
    // the fade-in window.
    assert!(buf[50] < 1.5 && buf[50] > 0.0);
}

/// Scenario 6: a read spanning the nominal length boundary returns the
/// remaining body samples plus as much plugin tail as fits, with no source
/// read for the tail portion.
#[test]
fn scenario_6_tail_read_past_nominal_length() {
    struct TailPlugin;
    impl Plugin for TailPlugin {
        fn can_support_io(&self, _n_in: u16, _n_out: u16) -> bool {
            true
        }
        fn configure_io(&mut self, _n_in: u16, _n_out: u16) -> bool {
            true
        }
        fn required_buffers(&self) -> u16 {
            1
        }
        fn set_block_size(&mut self, _n: usize) {}
        fn effective_latency(&self) -> u32 {
            0
        }
        fn effective_tailtime(&self) -> u32 {
            200
        }
        fn run(
            &mut self,
            _bufs: &mut [Vec<f32>],
            _cs: i64,
            _ce: i64,
            _rp: i64,
            _n: usize,
            _o: usize,
        ) -> bool {
            true
        }
        fn flush(&mut self) {}
    }

    let samples: Vec<f32> = vec![1.0; 1000];
    let region = mono_region(samples);
    // tail() only reports a plugin tail when fades run before the chain
    // (SPEC_FULL.md §4.G): that's the configuration under which reading
    // past the nominal length pulls from the plugin's tail rather than
    // stopping at the body boundary.
    region.set_fade_before_fx(true);
    region.add_plugin(Box::new(TailPlugin)).unwrap();

    let mut buf = vec![0.0; 400];
    let mut mix = Vec::new();
    let mut gain = Vec::new();
    let n = region.read_at(&mut buf, &mut mix, &mut gain, 900, 400, 0);

    // internal = 900, esamples = 1000 - 900 = 100, so to_read = 100; the
    // 200-sample plugin tail brings can_read to 300, and cnt - to_read
    // (300) does not further shrink it, so n == 100 + 200 = 300.
    assert_eq!(n, 300, "100 body samples plus 200 tail samples");
    assert!(buf[..100].iter().all(|&s| (s - 1.0).abs() < 1e-6), "body comes from the source");
    assert!(
        buf[100..300].iter().all(|&s| s.abs() < 1e-6),
        "tail is the plugin's silent output, not a re-read past the source's 1000 samples"
    );
}
