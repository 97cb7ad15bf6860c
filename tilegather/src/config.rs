//! Tiling parameters for the consumer GEMM kernels.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tile sizes and scheduling parameters shared by both kernel variants.
///
/// Loadable from JSON so tuned parameters can be pinned per shape
/// without rebuilding; [`TileConfig::candidates`] is the search space
/// the autotuner walks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileConfig {
    /// Output-tile rows (`BLOCK_M`)
    pub block_m: usize,
    /// Output-tile columns (`BLOCK_N`)
    pub block_n: usize,
    /// K-slice depth per load (`BLOCK_K`)
    pub block_k: usize,
    /// Row-tile group width for operand reuse (`GROUP_SIZE_M`)
    pub group_size_m: usize,
    /// Scheduling units for the persistent variant; 0 means one per
    /// available core
    pub num_workers: usize,
    /// Split the persistent epilogue store into two half-width subtiles
    pub epilogue_subtile: bool,
}

impl Default for TileConfig {
    fn default() -> Self {
        Self {
            block_m: 32,
            block_n: 32,
            block_k: 32,
            group_size_m: 4,
            num_workers: 0,
            epilogue_subtile: false,
        }
    }
}

impl TileConfig {
    /// Validate the parameters.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if any tile dimension or the
    /// group size is zero, or if `epilogue_subtile` is set with an odd
    /// `block_n` (the store splits into two equal halves).
    pub fn validate(&self) -> Result<()> {
        if self.block_m == 0 || self.block_n == 0 || self.block_k == 0 {
            return Err(Error::InvalidConfig(format!(
                "tile dims must be nonzero, got {}x{}x{}",
                self.block_m, self.block_n, self.block_k
            )));
        }
        if self.group_size_m == 0 {
            return Err(Error::InvalidConfig("group_size_m must be nonzero".into()));
        }
        if self.epilogue_subtile && self.block_n % 2 != 0 {
            return Err(Error::InvalidConfig(format!(
                "epilogue_subtile needs an even block_n, got {}",
                self.block_n
            )));
        }
        Ok(())
    }

    /// Parse a config from JSON.
    ///
    /// # Errors
    /// Returns an error on malformed JSON or invalid parameters.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Effective persistent worker count.
    #[must_use]
    pub fn effective_workers(&self) -> usize {
        if self.num_workers > 0 {
            self.num_workers
        } else {
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
        }
    }

    /// The autotune search space.
    #[must_use]
    pub fn candidates() -> Vec<Self> {
        let mut configs = Vec::new();
        for block_m in [16, 32] {
            for block_n in [32, 64] {
                for block_k in [32, 64] {
                    configs.push(Self {
                        block_m,
                        block_n,
                        block_k,
                        group_size_m: 4,
                        num_workers: 0,
                        epilogue_subtile: false,
                    });
                }
            }
        }
        configs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        TileConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_tile_rejected() {
        let cfg = TileConfig {
            block_k: 0,
            ..TileConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn odd_block_n_subtile_rejected() {
        let cfg = TileConfig {
            block_n: 33,
            epilogue_subtile: true,
            ..TileConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let cfg = TileConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert_eq!(TileConfig::from_json(&json).unwrap(), cfg);
    }

    #[test]
    fn candidates_all_valid() {
        for cfg in TileConfig::candidates() {
            cfg.validate().unwrap();
        }
    }
}
