//! The audio source collaborator.
//!
//! A `Source` is an opaque, read-only sample provider indexed by sample
//! offset. The region engine never decodes audio itself; it only reads
//! through this trait. [`read_from_sources`] is the small adapter the
//! read-at-position engine uses to pull samples for one channel while
//! translating channel-count mismatches.

use std::sync::Arc;

/// One channel's worth of readable, peakable audio.
///
/// Implementations are shared: the same `Source` may be read concurrently
/// by multiple regions, so `read` and `read_peaks` must not take an
/// exclusive lock on anything but their own internal caches.
pub trait Source: Send + Sync {
    /// Native sample rate of the underlying audio.
    fn sample_rate(&self) -> u32;

    /// Total number of samples available from this source.
    fn length(&self) -> u64;

    /// Read `count` samples starting at `offset` into `buf[..count]`.
    /// Returns the number of samples actually produced; per §4.C the
    /// caller treats any short read as total failure for that call.
    fn read(&self, buf: &mut [f32], offset: u64, count: usize) -> usize;

    /// Compute `n_peaks` (min, max) pairs over `[offset, offset+count)`,
    /// each pair summarising `samples_per_pixel` samples. Returns `false`
    /// if peaks could not be produced (e.g. analysis not yet available).
    fn read_peaks(
        &self,
        buf: &mut [(f32, f32)],
        n_peaks: usize,
        offset: u64,
        count: u64,
        samples_per_pixel: u64,
    ) -> bool;

    /// Whether this source has completed background analysis (peaks,
    /// transients). Analysis itself is an external collaborator; this
    /// crate only reads the flag and the resulting data.
    fn analysed(&self) -> bool {
        false
    }

    /// Sorted sample positions of detected transients, if analysed.
    fn transients(&self) -> &[u64] {
        &[]
    }
}

/// Read one channel's worth of samples for a region, translating between
/// session-absolute position and source offset, and handling the case
/// where the caller asks for a channel beyond the region's own channel
/// count.
///
/// `limit` is the number of samples available to read from this region's
/// sources (normally `region.length`, but analysis paths pass the full
/// source length for raw reads). `region_position` and `region_start` are
/// the region's `position` and `start` fields. Returns the number of
/// samples produced; per §4.C this is all-or-nothing — any short read from
/// the underlying source yields zero.
#[allow(clippy::too_many_arguments)]
pub fn read_from_sources(
    srcs: &[Arc<dyn Source>],
    limit: u64,
    buf: &mut [f32],
    pos_abs: i64,
    region_position: i64,
    region_start: u64,
    cnt: usize,
    chan: usize,
    replicate_missing_channels: bool,
) -> usize {
    if cnt == 0 {
        return 0;
    }
    let internal = pos_abs - region_position;
    if internal < 0 || internal as u64 >= limit {
        return 0;
    }
    let internal = internal as u64;

    let n_chan = srcs.len();
    let src = if chan < n_chan {
        &srcs[chan]
    } else if replicate_missing_channels && n_chan > 0 {
        &srcs[chan % n_chan]
    } else {
        for s in buf.iter_mut().take(cnt) {
            *s = 0.0;
        }
        return cnt;
    };

    let available = (limit - internal) as usize;
    let to_read = cnt.min(available);
    if to_read == 0 {
        return 0;
    }

    let produced = src.read(&mut buf[..to_read], region_start + internal, to_read);
    if produced != to_read {
        return 0;
    }
    to_read
}
