//! Error types for the region engine.
//!
//! The real-time read path (`Region::read_at` / `Region::render_at`) never
//! returns `Result`: failures there collapse to a `samples_written` of zero
//! per the contract in [`crate::region`]. `RegionError` covers the fallible,
//! non-real-time surface: plugin management, export, and persisted-state
//! round trips.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the non-real-time region API.
#[derive(Debug, Error)]
pub enum RegionError {
    /// `add_plugin` rejected a plugin because it cannot be configured at the
    /// region's channel count.
    #[error("plugin cannot be configured for {n_chan} channel(s)")]
    PluginConfigMismatch { n_chan: u16 },

    /// A requested plugin index was not present in the chain.
    #[error("no plugin at index {index}")]
    PluginNotFound { index: usize },

    /// `do_export` failed partway through; the partial output file named
    /// here has already been unlinked.
    #[error("export to {path:?} failed: {source}")]
    ExportFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The FLAC encoder could not be initialised for the given stream
    /// parameters.
    #[error("could not initialise FLAC encoder for {path:?}")]
    EncoderInit { path: PathBuf },

    /// Persisted-state document failed to parse.
    #[error("invalid region state: {0}")]
    InvalidState(String),

    /// Configuration file failed to parse.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RegionError>;
