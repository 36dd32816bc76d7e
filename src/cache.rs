//! The read cache (§4.D).
//!
//! Per-channel scratch buffers keyed by region-local offset, memoising one
//! window of post-envelope, post-fade-before-fx, post-plugin samples so the
//! render loop pays for the source read and plugin run once per window
//! rather than once per channel.

/// Per-channel scratch owned by a region. `[cache_start, cache_end)` is the
/// region-local half-open range currently cached; it is valid iff
/// `cache_start >= 0` (modelled here as `Option`, which is the idiomatic
/// equivalent of the sentinel `-1` the original uses).
pub struct ReadCache {
    channels: Vec<Vec<f32>>,
    range: Option<(i64, i64)>,
    tail: usize,
}

impl Default for ReadCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadCache {
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            range: None,
            tail: 0,
        }
    }

    pub fn cache_start(&self) -> Option<i64> {
        self.range.map(|(s, _)| s)
    }

    pub fn cache_end(&self) -> Option<i64> {
        self.range.map(|(_, e)| e)
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Drop the cached window, e.g. on observing `invalidated`.
    pub fn invalidate(&mut self) {
        self.range = None;
        self.tail = 0;
    }

    /// Whether `[offset, offset + count)` lies entirely inside the cached
    /// window. Per invariant 7, a mono region with no plugins never
    /// populates (or consults) the cache — callers gate that case
    /// themselves before calling this.
    pub fn covers(&self, offset: i64, count: i64) -> bool {
        match self.range {
            Some((start, end)) => offset >= start && offset + count <= end,
            None => false,
        }
    }

    /// Copy `count` samples for `chan` starting at region-local `offset`
    /// into `out`. Panics if the range isn't covered; callers must check
    /// [`ReadCache::covers`] first.
    pub fn copy_out(&self, chan: usize, offset: i64, count: usize, out: &mut [f32]) {
        let start = self.range.expect("copy_out called without a cached range").0;
        let local = (offset - start) as usize;
        out[..count].copy_from_slice(&self.channels[chan][local..local + count]);
    }

    /// Ensure `n_chan` channel buffers of at least `n_proc` samples exist,
    /// zeroing their contents for a fresh fill.
    pub fn ensure_buffers(&mut self, n_chan: usize, n_proc: usize) {
        self.channels.resize_with(n_chan, Vec::new);
        for ch in self.channels.iter_mut() {
            ch.clear();
            ch.resize(n_proc, 0.0);
        }
    }

    /// Write one channel's freshly-rendered data into the cache slot.
    pub fn write_channel(&mut self, chan: usize, data: &[f32]) {
        let dst = &mut self.channels[chan];
        dst[..data.len()].copy_from_slice(data);
    }

    /// Mutable access to all channel buffers at once, for the plugin chain
    /// to run across (it needs `&mut [Vec<f32>]`, not one channel at a
    /// time).
    pub fn channels_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.channels
    }

    pub fn channel(&self, chan: usize) -> &[f32] {
        &self.channels[chan]
    }

    /// Record the window this fill covers, per §4.D's "the first channel
    /// request... fills the cache" rule.
    pub fn commit(&mut self, start: i64, end: i64, tail: usize) {
        self.range = Some((start, end));
        self.tail = tail;
    }
}
