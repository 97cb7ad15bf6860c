//! Fused all-gather GEMM for row-sharded matrix multiplies.
//!
//! Each rank holds an `[m_per_rank, K]` row shard of A and an
//! `[n_per_rank, K]` column shard of B. A fused call gathers A across
//! the group while the GEMM consumes segments as they land, hiding the
//! transfer behind compute. Tiles block on per-segment readiness flags
//! rather than on a bulk barrier, so computation over the caller's own
//! shard starts immediately.
//!
//! Ranks are threads sharing one address space; "remote" writes are
//! plain stores into a peer's workspace slab, made visible by the
//! release/acquire flag protocol in [`signal`]. The same protocol an
//! RDMA-backed deployment would use, exercised at memory speed.

pub mod allgather;
pub mod config;
mod context;
mod error;
pub mod matrix;
pub mod ops;
pub mod signal;
pub mod stream;
pub mod swizzle;
pub mod symm;
pub mod topology;

pub use allgather::AllGatherMethod;
pub use config::TileConfig;
pub use context::{AgGemmContext, ContextOptions};
pub use error::{Error, Result};
pub use matrix::Matrix;
pub use topology::RankLayout;
