//! # NVOverlay
//!
//! Trace-driven simulator of a persistent-memory subsystem that builds
//! multi-versioned, epoch-aligned snapshots of DRAM-resident state on
//! byte-addressable non-volatile memory.
//!
//! The engine consumes a serialized stream of per-core memory events
//! (loads, stores, and L1/L2/L3 eviction notifications) and maintains,
//! at cache-line granularity, enough version history to reconstruct any
//! epoch-aligned snapshot of the working set from the simulated NVM image.
//!
//! ## Pipeline
//!
//! ```text
//! event -> VersionTable -> (on eviction) -> OmcBuffer -> (on evict) -> Overlay + Nvm
//!                      \-> core_recv -> epoch controller \
//!                          (on store budget) advance epoch
//!                          (on walk interval) tag walk -> OmcBuffer
//!                                                      \-> stable epoch -> Overlay::epoch_merge -> Omt
//! ```
//!
//! ## Quick start
//!
//! ```rust
//! use nvoverlay::{NvOverlay, NvOverlayConfig};
//!
//! let mut cfg = NvOverlayConfig::default();
//! cfg.cores = 2;
//! let mut sim = NvOverlay::new(cfg).expect("valid configuration");
//!
//! sim.store(0, 0x1000, 0);
//! sim.store(0, 0x1000, 1);
//! sim.load(1, 0x1000, 2);
//!
//! let stats = sim.stats();
//! assert_eq!(stats.cores[0].stores, 2);
//! assert_eq!(stats.cores[1].loads, 1);
//! ```
//!
//! ## Modules
//!
//! - [`vtable`]: per-line coherence/version state machine
//! - [`cpu`]: per-core epochs and inclusive tag-array mirrors
//! - [`omcbuf`]: set-associative write-combining buffer in front of the NVM
//! - [`overlay`]: per-epoch overlay pages with size-class accounting
//! - [`omt`]: radix index from line address to owning overlay epoch
//! - [`nvm`]: banked NVM latency oracle
//! - [`engine`]: event dispatch and stable-epoch control
//! - [`trace`]: fixed-size trace record codec and serial-merged reader

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod addr;
pub mod bitmap;
pub mod config;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod nvm;
pub mod omcbuf;
pub mod omt;
pub mod overlay;
pub mod radix;
pub mod stats;
pub mod trace;
pub mod vtable;

pub use config::{CacheGeometry, NvOverlayConfig, NvmConfig, OmcBufConfig};
pub use engine::NvOverlay;
pub use error::{NvError, Result};
pub use stats::SimStats;
pub use trace::{EventKind, TraceReader, TraceRecord, TraceWriter};
