//! Non-realtime analysis over a region's raw samples (§4.H).
//!
//! These walk `region.read_raw` in fixed-size blocks across every channel
//! rather than pulling the whole region into memory, and support
//! cooperative cancellation through [`Progress`] — analysis on a
//! multi-hour region should not require the caller to wait out the whole
//! pass just to change their mind.

use crate::region::Region;

const BLOCK_SAMPLES: usize = 65_536;

/// Cancellation and progress reporting for a long-running analysis pass.
/// The default no-op implementation never cancels and ignores progress,
/// which is enough for tests and for callers that don't need cancellation.
pub trait Progress {
    fn is_cancelled(&self) -> bool {
        false
    }

    /// Called after each block with a fraction in `[0.0, 1.0]`.
    fn report(&mut self, _fraction: f32) {}
}

/// A [`Progress`] that never cancels and drops progress reports, for
/// callers that just want the analysis to run to completion.
pub struct NoProgress;

impl Progress for NoProgress {}

/// Peak absolute sample value across `[start, start+len)`, over every
/// channel, or `-1.0` if the pass was cancelled before completion (§4.H's
/// sentinel).
pub fn max_amplitude(region: &Region, start: u64, len: u64, progress: &mut impl Progress) -> f32 {
    let n_chan = region.n_chan();
    let mut max = 0.0f32;
    let mut remaining = len;
    let mut pos = start as i64;
    let mut buf = vec![0.0f32; BLOCK_SAMPLES];

    while remaining > 0 {
        if progress.is_cancelled() {
            return -1.0;
        }
        let chunk = (remaining as usize).min(BLOCK_SAMPLES);
        let mut produced = 0usize;
        for chan in 0..n_chan {
            let n = region.read_raw(&mut buf[..chunk], pos, chunk, chan);
            produced = produced.max(n);
            for &s in &buf[..n] {
                let a = s.abs();
                if a > max {
                    max = a;
                }
            }
        }
        if produced == 0 {
            break;
        }
        pos += produced as i64;
        remaining -= produced as u64;
        progress.report(1.0 - remaining as f32 / len.max(1) as f32);
    }
    max
}

/// Root-mean-square level across `[start, start+len)` summed over every
/// channel: `sqrt(2 * sum(x^2) / (N * n_chan))` (§4.H). Returns `-1.0` if
/// cancelled.
pub fn rms(region: &Region, start: u64, len: u64, progress: &mut impl Progress) -> f32 {
    let n_chan = region.n_chan().max(1);
    let mut sum_sq = 0.0f64;
    let mut remaining = len;
    let mut pos = start as i64;
    let mut buf = vec![0.0f32; BLOCK_SAMPLES];

    while remaining > 0 {
        if progress.is_cancelled() {
            return -1.0;
        }
        let chunk = (remaining as usize).min(BLOCK_SAMPLES);
        let mut produced = 0usize;
        for chan in 0..region.n_chan() {
            let n = region.read_raw(&mut buf[..chunk], pos, chunk, chan);
            produced = produced.max(n);
            for &s in &buf[..n] {
                sum_sq += (s as f64) * (s as f64);
            }
        }
        if produced == 0 {
            break;
        }
        pos += produced as i64;
        remaining -= produced as u64;
        progress.report(1.0 - remaining as f32 / len.max(1) as f32);
    }
    if len == 0 {
        return 0.0;
    }
    (2.0 * sum_sq / (len as f64 * n_chan as f64)).sqrt() as f32
}

/// A run of samples at or below `threshold` at least `min_length` samples
/// long, expressed as a region-local `[start, end)` range, already shrunk by
/// `fade_len` on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SilentRange {
    pub start: u64,
    pub end: u64,
}

/// Find silent stretches across `[start, start+len)`. A sample position is
/// "silent" when the max absolute value across every channel is `<=
/// threshold`; a run only counts once it reaches `min_length` samples,
/// matching the original's transition-triggered bookkeeping rather than
/// reporting every sub-run. Each surviving interval is then shrunk by
/// `fade_len` samples on each side (§4.H) — a range narrower than `2 *
/// fade_len` after shrinking is dropped. Returns an empty vec if cancelled.
pub fn find_silence(
    region: &Region,
    start: u64,
    len: u64,
    threshold: f32,
    min_length: u64,
    fade_len: u64,
    progress: &mut impl Progress,
) -> Vec<SilentRange> {
    let n_chan = region.n_chan();
    let mut ranges = Vec::new();
    let mut remaining = len;
    let mut pos = start as i64;
    let mut buf = vec![0.0f32; BLOCK_SAMPLES];
    let mut chan_buf = vec![0.0f32; BLOCK_SAMPLES];

    let mut in_silence = false;
    let mut run_start = 0u64;
    let mut cursor = start;

    while remaining > 0 {
        if progress.is_cancelled() {
            return Vec::new();
        }
        let chunk = (remaining as usize).min(BLOCK_SAMPLES);
        for s in buf[..chunk].iter_mut() {
            *s = 0.0;
        }
        let mut produced = 0usize;
        for chan in 0..n_chan {
            let n = region.read_raw(&mut chan_buf[..chunk], pos, chunk, chan);
            produced = produced.max(n);
            for i in 0..n {
                if chan_buf[i].abs() > buf[i] {
                    buf[i] = chan_buf[i].abs();
                }
            }
        }
        if produced == 0 {
            break;
        }
        for &peak in &buf[..produced] {
            let silent = peak <= threshold;
            if silent && !in_silence {
                in_silence = true;
                run_start = cursor;
            } else if !silent && in_silence {
                in_silence = false;
                push_shrunk(&mut ranges, run_start, cursor, min_length, fade_len);
            }
            cursor += 1;
        }
        pos += produced as i64;
        remaining -= produced as u64;
        progress.report(1.0 - remaining as f32 / len.max(1) as f32);
    }
    if in_silence {
        push_shrunk(&mut ranges, run_start, cursor, min_length, fade_len);
    }
    ranges
}

fn push_shrunk(ranges: &mut Vec<SilentRange>, start: u64, end: u64, min_length: u64, fade_len: u64) {
    if end - start < min_length {
        return;
    }
    let shrunk_start = start + fade_len;
    let shrunk_end = end.saturating_sub(fade_len);
    if shrunk_end > shrunk_start {
        ranges.push(SilentRange { start: shrunk_start, end: shrunk_end });
    }
}
