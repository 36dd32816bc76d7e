//! Bounce a region to a 24-bit FLAC file (§4.I).
//!
//! Reads the region's fully gain-shaped output (the same signal a playlist
//! would mix in) one block at a time, interleaves channels, and hands the
//! result to `libFLAC` via `flac-bound`. A failure partway through removes
//! the partial output file rather than leaving a truncated one behind.

use std::path::Path;

use flac_bound::FlacEncoder;
use tracing::{error, info};

use crate::error::{RegionError, Result};
use crate::region::Region;

const BLOCK_FRAMES: usize = 8192;
const BITS_PER_SAMPLE: u32 = 24;

/// Bounce `region`'s full length (including plugin tail) to `path` as FLAC.
/// `sample_rate` is the rate to stamp in the stream header; this crate does
/// not resample, so it should match the region's sources.
pub fn do_export(region: &Region, path: impl AsRef<Path>, sample_rate: u32) -> Result<()> {
    let path = path.as_ref();
    match do_export_inner(region, path, sample_rate) {
        Ok(()) => Ok(()),
        Err(e) => {
            if path.exists() {
                let _ = std::fs::remove_file(path);
            }
            Err(e)
        }
    }
}

fn do_export_inner(region: &Region, path: &Path, sample_rate: u32) -> Result<()> {
    let n_chan = region.n_chan() as u32;
    let path_str = path.to_str().ok_or_else(|| RegionError::EncoderInit { path: path.to_path_buf() })?;

    let mut encoder = FlacEncoder::new()
        .ok_or_else(|| RegionError::EncoderInit { path: path.to_path_buf() })?
        .channels(n_chan)
        .bits_per_sample(BITS_PER_SAMPLE)
        .sample_rate(sample_rate)
        .compression_level(5)
        .init_file(path_str)
        .map_err(|_| RegionError::EncoderInit { path: path.to_path_buf() })?;

    let length = region.length();
    let tail = region.fx_tail() as u64;
    let total = length + tail;
    let mut pos = region.position();

    let mut channel_bufs: Vec<Vec<f32>> = vec![vec![0.0; BLOCK_FRAMES]; n_chan as usize];
    let mut mix = Vec::new();
    let mut gain = Vec::new();
    let mut interleaved = vec![0i32; BLOCK_FRAMES * n_chan as usize];

    let mut written = 0u64;
    while written < total {
        let remaining = (total - written) as usize;
        let block = remaining.min(BLOCK_FRAMES);

        let mut produced = block;
        for (chan, buf) in channel_bufs.iter_mut().enumerate() {
            let n = region.read_at(&mut buf[..block], &mut mix, &mut gain, pos, block, chan);
            produced = produced.min(n);
        }
        if produced == 0 {
            break;
        }

        interleaved.truncate(produced * n_chan as usize);
        interleaved.resize(produced * n_chan as usize, 0);
        for frame in 0..produced {
            for (chan, buf) in channel_bufs.iter().enumerate() {
                interleaved[frame * n_chan as usize + chan] = to_i24(buf[frame]);
            }
        }

        if !encoder.process_interleaved(&interleaved, produced as u32) {
            return Err(RegionError::ExportFailed {
                path: path.to_path_buf(),
                source: std::io::Error::other("FLAC encoder rejected a block"),
            });
        }

        pos += produced as i64;
        written += produced as u64;
    }

    if let Err((_enc, state)) = encoder.finish() {
        return Err(RegionError::ExportFailed {
            path: path.to_path_buf(),
            source: std::io::Error::other(format!("FLAC finish failed: {state:?}")),
        });
    }

    info!(region = %region.id(), path = %path.display(), frames = written, "exported region");
    Ok(())
}

fn to_i24(sample: f32) -> i32 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * 8_388_607.0) as i32
}
