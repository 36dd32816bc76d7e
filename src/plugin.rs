//! The in-region plugin chain.
//!
//! Plugins are the opaque effect-host collaborator (§6): the region knows
//! only their latency, tail time, and a `run` entry point. [`PluginChain`]
//! is the runner described in §4.E — it accumulates latency/tail across an
//! ordered list of plugins, flushes on discontinuity, and performs the
//! "latent read" left-shift that aligns a freshly-primed plugin's output to
//! the caller's requested window.

use parking_lot::Mutex;
use tracing::warn;

/// A single in-region effect.
///
/// Single-threaded per §5: only one region read may run a given plugin at a
/// time. [`PluginChain`] enforces this by holding each plugin behind its own
/// mutex rather than relying on the caller.
pub trait Plugin: Send + Sync {
    /// Whether this plugin can be wired up for the given channel counts.
    fn can_support_io(&self, n_in: u16, n_out: u16) -> bool;

    /// Commit to the given channel counts. Returns `false` on failure.
    fn configure_io(&mut self, n_in: u16, n_out: u16) -> bool;

    /// Channels this plugin requires once configured.
    fn required_buffers(&self) -> u16;

    fn set_block_size(&mut self, n: usize);

    fn effective_latency(&self) -> u32;

    fn effective_tailtime(&self) -> u32;

    /// Process `n_samples` in place across `bufs`, one `Vec<f32>` per
    /// channel, writing at `offset`. `cycle_start`/`cycle_end` are
    /// session-absolute sample positions corrected for accumulated latency.
    /// Returns `false` on failure; the chain removes a failing plugin.
    fn run(
        &mut self,
        bufs: &mut [Vec<f32>],
        cycle_start: i64,
        cycle_end: i64,
        region_pos: i64,
        n_samples: usize,
        offset: usize,
    ) -> bool;

    /// Discard internal state (reverb tails, filter history) on a
    /// discontinuous jump in the read position.
    fn flush(&mut self);
}

struct PluginEntry {
    plugin: Mutex<Box<dyn Plugin>>,
    latency: u32,
    tail: u32,
}

/// Small piece of state that advances across `apply` calls: the session
/// position the chain last rendered up to, whether the next call is a
/// "latent read" that must over-read to prime the chain, and the block
/// size last propagated to every plugin.
struct RunState {
    fx_pos: i64,
    fx_latent_read: bool,
    block_size: usize,
}

/// Ordered effect chain plus the running state described in §4.E.
pub struct PluginChain {
    plugins: Vec<PluginEntry>,
    run: Mutex<RunState>,
}

impl Default for PluginChain {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginChain {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
            run: Mutex::new(RunState {
                fx_pos: 0,
                fx_latent_read: false,
                block_size: 1024,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Sum of `effective_latency()` over the chain (invariant 6).
    pub fn total_latency(&self) -> u32 {
        self.plugins.iter().map(|p| p.latency).sum()
    }

    /// Max of `effective_tailtime()` over the chain (invariant 6).
    pub fn total_tail(&self) -> u32 {
        self.plugins.iter().map(|p| p.tail).max().unwrap_or(0)
    }

    pub fn set_latent_read(&self, latent: bool) {
        self.run.lock().fx_latent_read = latent;
    }

    pub fn is_latent_read(&self) -> bool {
        self.run.lock().fx_latent_read
    }

    /// Insert a plugin at `index`, rejecting it (per §7 error kind 3) if it
    /// cannot be configured for `n_chan` channels.
    pub fn insert(
        &mut self,
        index: usize,
        mut plugin: Box<dyn Plugin>,
        n_chan: u16,
    ) -> Result<(), crate::error::RegionError> {
        if !plugin.can_support_io(n_chan, n_chan) || !plugin.configure_io(n_chan, n_chan) {
            return Err(crate::error::RegionError::PluginConfigMismatch { n_chan });
        }
        let latency = plugin.effective_latency();
        let tail = plugin.effective_tailtime();
        let index = index.min(self.plugins.len());
        self.plugins.insert(
            index,
            PluginEntry {
                plugin: Mutex::new(plugin),
                latency,
                tail,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<(), crate::error::RegionError> {
        if index >= self.plugins.len() {
            return Err(crate::error::RegionError::PluginNotFound { index });
        }
        self.plugins.remove(index);
        Ok(())
    }

    pub fn reorder(&mut self, new_order: &[usize]) {
        if new_order.len() != self.plugins.len() {
            return;
        }
        let mut reordered = Vec::with_capacity(self.plugins.len());
        for &i in new_order {
            if i >= self.plugins.len() {
                return;
            }
        }
        // drain in the requested order; safe because we validated indices.
        let mut taken: Vec<Option<PluginEntry>> =
            self.plugins.drain(..).map(Some).collect();
        for &i in new_order {
            reordered.push(taken[i].take().expect("index used twice in reorder"));
        }
        self.plugins = reordered;
    }

    /// Remove a plugin by identity after it failed `run`, per §4.E / §7
    /// error kind 2. Called with the index captured during `apply`.
    fn remove_failed(&mut self, index: usize) {
        if index < self.plugins.len() {
            self.plugins.remove(index);
        }
    }

    /// Run the chain across `bufs` (one `Vec<f32>` per channel, already
    /// sized to `n_samples`), covering session-absolute range
    /// `[start_sample_abs, end_sample_abs)`. `region_pos` is passed through
    /// to each plugin's `run` call. `configured_block_size` is the session's
    /// configured sub-block size (§10.C's `EngineDefaults::fx_block_size`),
    /// not the size of this particular request — `n_samples` is run in
    /// sub-blocks of at most that many frames.
    ///
    /// Returns `false` if a plugin failed; the caller must re-read after
    /// invalidation (the failing plugin has already been removed).
    pub fn apply(
        &mut self,
        bufs: &mut [Vec<f32>],
        start_sample_abs: i64,
        end_sample_abs: i64,
        region_pos: i64,
        n_samples: usize,
        configured_block_size: usize,
    ) -> bool {
        if self.plugins.is_empty() {
            return true;
        }

        let block_size = configured_block_size.max(1);
        let changed = {
            let mut run = self.run.lock();
            let changed = run.block_size != block_size;
            if changed {
                run.block_size = block_size;
            }
            changed
        };
        if changed {
            for entry in &self.plugins {
                entry.plugin.lock().set_block_size(block_size);
            }
        }

        let discontinuous = {
            let run = self.run.lock();
            start_sample_abs != run.fx_pos
        };

        let mut failed_at: Option<usize> = None;
        let mut latency_offset: i64 = 0;
        // Shrinks as latent reads get left-shifted and dropped by earlier
        // plugins in the chain; later plugins must not run past it.
        let mut remaining = n_samples;

        'plugins: for (index, entry) in self.plugins.iter().enumerate() {
            let mut plugin = entry.plugin.lock();
            if discontinuous {
                plugin.flush();
            }

            let latency = entry.latency as i64;
            let latent_read = self.run.lock().fx_latent_read;

            let mut offset = 0usize;
            while offset < remaining {
                let chunk = (remaining - offset).min(block_size.max(1));
                let cycle_start = start_sample_abs + offset as i64 - latency_offset;
                let cycle_end = cycle_start + chunk as i64;
                let ok = plugin.run(bufs, cycle_start, cycle_end, region_pos, chunk, offset);
                if !ok {
                    warn!(plugin_index = index, "plugin run failed, scheduling removal");
                    failed_at = Some(index);
                    break 'plugins;
                }
                offset += chunk;
            }

            if latent_read && latency > 0 {
                let shift = latency as usize;
                for buf in bufs.iter_mut() {
                    if buf.len() > shift {
                        buf.rotate_left(shift);
                        buf.truncate(buf.len() - shift);
                    }
                }
                remaining = remaining.saturating_sub(shift);
            }
            if !latent_read {
                latency_offset += latency;
            }
        }

        if let Some(index) = failed_at {
            self.remove_failed(index);
            return false;
        }

        let mut run = self.run.lock();
        run.fx_pos = end_sample_abs;
        run.fx_latent_read = false;
        true
    }
}

#[cfg(test)]
pub mod test_support {
    use super::Plugin;

    /// A plugin that adds a constant to every sample and reports a fixed
    /// latency/tail, for exercising the chain runner without real DSP.
    pub struct GainPlugin {
        pub add: f32,
        pub latency: u32,
        pub tail: u32,
        pub flushed: bool,
        pub fail_after: Option<usize>,
        calls: usize,
    }

    impl GainPlugin {
        pub fn new(add: f32, latency: u32, tail: u32) -> Self {
            Self {
                add,
                latency,
                tail,
                flushed: false,
                fail_after: None,
                calls: 0,
            }
        }
    }

    impl Plugin for GainPlugin {
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
            self.latency
        }
        fn effective_tailtime(&self) -> u32 {
            self.tail
        }
        fn run(
            &mut self,
            bufs: &mut [Vec<f32>],
            _cycle_start: i64,
            _cycle_end: i64,
            _region_pos: i64,
            n_samples: usize,
            offset: usize,
        ) -> bool {
            self.calls += 1;
            if Some(self.calls) == self.fail_after {
                return false;
            }
            for buf in bufs.iter_mut() {
                for s in buf.iter_mut().skip(offset).take(n_samples) {
                    *s += self.add;
                }
            }
            true
        }
        fn flush(&mut self) {
            self.flushed = true;
        }
    }
}
