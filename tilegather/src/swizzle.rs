//! Tile scheduling: grouped traversal plus rank-aware rotation.
//!
//! Maps a linear work-item id to an output (row-tile, col-tile) pair.
//! The grouped mapping keeps `group_size_m` row-tiles sharing a column
//! range adjacent for operand reuse; on top of it, a rotation shifts
//! row-tile assignment so the caller's own shard is scheduled first,
//! then (for multi-node layouts) the rest of its node, hiding
//! transport latency behind locally-computable tiles.
//!
//! The rotation is a bijection over row-tile indices, so correctness
//! never depends on it: disabling the swizzle must produce identical
//! output, and the tests hold the engine to that.

use crate::config::TileConfig;
use crate::topology::RankLayout;

/// Maps linear work-item ids to output tiles for one fused call.
#[derive(Debug, Clone)]
pub struct TileScheduler {
    num_pid_m: usize,
    num_pid_n: usize,
    block_m: usize,
    group_size_m: usize,
    m: usize,
    m_per_rank: usize,
    layout: RankLayout,
    swizzle: bool,
}

impl TileScheduler {
    /// Build a scheduler for an `[m, n]` output.
    ///
    /// `m_per_rank` is the row span owned by each rank's shard
    /// (`m / num_ranks` for the fused path, or `m` for a gemm-only
    /// call where all of A is local).
    ///
    /// # Panics
    /// Panics if any dimension is zero.
    #[must_use]
    pub fn new(
        m: usize,
        n: usize,
        m_per_rank: usize,
        cfg: &TileConfig,
        layout: RankLayout,
        swizzle: bool,
    ) -> Self {
        assert!(m > 0 && n > 0 && m_per_rank > 0);
        Self {
            num_pid_m: m.div_ceil(cfg.block_m),
            num_pid_n: n.div_ceil(cfg.block_n),
            block_m: cfg.block_m,
            group_size_m: cfg.group_size_m,
            m,
            m_per_rank,
            layout,
            swizzle,
        }
    }

    /// Total output tiles.
    #[must_use]
    pub fn num_tiles(&self) -> usize {
        self.num_pid_m * self.num_pid_n
    }

    /// Row tiles.
    #[must_use]
    pub fn num_row_tiles(&self) -> usize {
        self.num_pid_m
    }

    /// Map a linear work-item id to its (row-tile, col-tile) pair.
    ///
    /// # Panics
    /// Panics if `id >= num_tiles()`.
    #[must_use]
    pub fn tile(&self, id: usize) -> (usize, usize) {
        assert!(id < self.num_tiles(), "tile id out of range");
        let num_pid_in_group = self.group_size_m * self.num_pid_n;
        let group_id = id / num_pid_in_group;
        let first_pid_m = group_id * self.group_size_m;
        let group_rows = (self.num_pid_m - first_pid_m).min(self.group_size_m);
        let pid_m = first_pid_m + (id % num_pid_in_group) % group_rows;
        let pid_n = (id % num_pid_in_group) / group_rows;
        (self.rotate(pid_m), pid_n)
    }

    /// Inclusive range of ranks whose shards the row tile spans.
    ///
    /// These are exactly the flags the tile must wait on before its
    /// first load.
    #[must_use]
    pub fn rank_range(&self, pid_m: usize) -> (usize, usize) {
        let offs_m = pid_m * self.block_m;
        let begin = offs_m / self.m_per_rank;
        let end = ((offs_m + self.block_m).min(self.m) - 1) / self.m_per_rank;
        (begin, end)
    }

    /// Apply the rank-aware row-tile rotation.
    fn rotate(&self, pid_m: usize) -> usize {
        if !self.swizzle || self.layout.num_ranks == 1 {
            return pid_m;
        }
        let whole_tiles_per_shard = self.m_per_rank % self.block_m == 0;
        if self.layout.is_multi_node() && whole_tiles_per_shard {
            // Two-step rotation: own node's data first, then own
            // local-rank's shard within any node.
            let tiles_per_shard = self.m_per_rank / self.block_m;
            let m_rank = pid_m / tiles_per_shard;
            let intra = pid_m % tiles_per_shard;
            let rpn = self.layout.ranks_per_node;
            let node = (m_rank / rpn + self.layout.node_id()) % self.layout.num_nodes();
            let local = (m_rank % rpn + self.layout.rank) % rpn;
            (node * rpn + local) * tiles_per_shard + intra
        } else {
            // Plain shift so the caller's own shard comes first. Also
            // the fallback when a shard spans a fractional row tile,
            // where the rank decomposition above is undefined.
            let shift = (self.layout.rank * self.m_per_rank).div_ceil(self.block_m);
            (pid_m + shift) % self.num_pid_m
        }
    }
}
