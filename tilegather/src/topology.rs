//! Rank and node layout for the gather group.
//!
//! A rank is one participating device; ranks are grouped into nodes of
//! `ranks_per_node`. The hierarchical transport and the two-step
//! swizzle both decompose a rank id into `(node_id, local_rank)`.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// This rank's position in the gather group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankLayout {
    /// This rank's id (`0..num_ranks`)
    pub rank: usize,
    /// Total number of ranks in the group
    pub num_ranks: usize,
    /// Ranks per node; equals `num_ranks` for a single-node group
    pub ranks_per_node: usize,
}

impl RankLayout {
    /// Build and validate a layout.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if `rank` is out of range, any
    /// count is zero, or `ranks_per_node` does not divide `num_ranks`
    /// evenly; there is no partial-node algorithm.
    pub fn new(rank: usize, num_ranks: usize, ranks_per_node: usize) -> Result<Self> {
        if num_ranks == 0 || ranks_per_node == 0 {
            return Err(Error::InvalidConfig(
                "num_ranks and ranks_per_node must be nonzero".into(),
            ));
        }
        if rank >= num_ranks {
            return Err(Error::InvalidConfig(format!(
                "rank {rank} out of range for num_ranks {num_ranks}"
            )));
        }
        if num_ranks % ranks_per_node != 0 {
            return Err(Error::InvalidConfig(format!(
                "ranks_per_node {ranks_per_node} does not divide num_ranks {num_ranks}"
            )));
        }
        Ok(Self {
            rank,
            num_ranks,
            ranks_per_node,
        })
    }

    /// Single-node layout (`ranks_per_node == num_ranks`).
    ///
    /// # Errors
    /// Returns an error if `rank >= num_ranks` or `num_ranks == 0`.
    pub fn single_node(rank: usize, num_ranks: usize) -> Result<Self> {
        Self::new(rank, num_ranks, num_ranks)
    }

    /// Node this rank lives on.
    #[must_use]
    pub fn node_id(&self) -> usize {
        self.rank / self.ranks_per_node
    }

    /// Rank id within its node.
    #[must_use]
    pub fn local_rank(&self) -> usize {
        self.rank % self.ranks_per_node
    }

    /// Number of nodes in the group.
    #[must_use]
    pub fn num_nodes(&self) -> usize {
        self.num_ranks / self.ranks_per_node
    }

    /// Whether the group spans more than one node.
    #[must_use]
    pub fn is_multi_node(&self) -> bool {
        self.num_nodes() > 1
    }

    /// The same layout seen from another rank.
    #[must_use]
    pub fn with_rank(&self, rank: usize) -> Self {
        Self { rank, ..*self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_decomposition() {
        let l = RankLayout::new(5, 8, 4).unwrap();
        assert_eq!(l.node_id(), 1);
        assert_eq!(l.local_rank(), 1);
        assert_eq!(l.num_nodes(), 2);
        assert!(l.is_multi_node());
    }

    #[test]
    fn single_node_is_not_multi() {
        let l = RankLayout::single_node(0, 4).unwrap();
        assert_eq!(l.num_nodes(), 1);
        assert!(!l.is_multi_node());
    }

    #[test]
    fn ragged_node_count_rejected() {
        assert!(RankLayout::new(0, 6, 4).is_err());
        assert!(RankLayout::new(4, 4, 4).is_err());
        assert!(RankLayout::new(0, 0, 1).is_err());
    }
}
