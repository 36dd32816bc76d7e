//! # Region Engine
//!
//! The audio region read engine of a digital audio workstation: given a
//! timeline position and a sample count, produce rendered audio samples for
//! a single region (a named, bounded view over one or more audio source
//! files, decorated with gain scaling, gain envelope, fade-in, fade-out, and
//! an optional in-region plugin chain).
//!
//! **Purpose:** Back the read side of playlist mixing. A playlist layers
//! many regions, calling each region's [`Region::read_at`] and expecting the
//! region to mix its contribution into the caller's buffer while also
//! attenuating already-mixed data beneath it (the opaque/crossfade
//! contract).
//!
//! **Architecture:** A breakpoint curve primitive ([`curve`]) underlies both
//! gain envelopes and fade shapes ([`fade`]); [`region`] ties curves, the
//! read cache ([`cache`]), the source adapter ([`source`]), and the plugin
//! chain runner ([`plugin`]) together into the read-at-position algorithm.
//! [`analysis`] and [`export`] are non-real-time passes over a region's raw
//! samples; [`state`] and [`config`] round out the ambient persistence and
//! configuration surface.
//!
//! **Traceability:** Implements the audio region read engine specification
//! (data model §3, component design §4, concurrency model §5).

pub mod analysis;
pub mod cache;
pub mod config;
pub mod curve;
pub mod error;
pub mod events;
pub mod export;
pub mod fade;
pub mod plugin;
pub mod region;
pub mod source;
pub mod state;

pub use error::{RegionError, Result};
pub use region::Region;
