//! Multi-rank driver for `tilegather`.
//!
//! [`RankGroup`] fans a closure out over one OS thread per rank,
//! [`AgGemmEngine`] shards full matrices across a group and reassembles
//! the output, [`reference`] holds the dense check kernel, and
//! [`autotune`] searches tile configurations by wall-clock timing.

pub mod autotune;
pub mod engine;
pub mod group;
pub mod reference;

pub use autotune::{autotune, TuneReport};
pub use engine::AgGemmEngine;
pub use group::RankGroup;
