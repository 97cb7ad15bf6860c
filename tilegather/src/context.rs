//! Execution context and per-call orchestration.
//!
//! An [`AgGemmContext`] is the long-lived state bound to one rank of a
//! gather group: the symmetric workspace and flag buffers, the comm
//! scratch for the phased barrier, the chosen transport, the tiling
//! parameters, two execution streams, and the phase counter. Contexts
//! are created collectively (one call builds the whole group, so
//! every rank's buffers exist before any rank can touch them) and are
//! reused call-over-call; the phase counter advancing by 2 per
//! invocation provides temporal isolation instead of reallocation.
//!
//! Per call the state machine runs Idle, LocalShardPublished, then
//! Gathering and Computing in parallel, then Complete. The publish
//! runs inline on the
//! calling thread; the transport and the GEMM are then issued on their
//! own streams, both ordered after the publish point, racing safely
//! because the GEMM blocks on exactly the flags each tile needs; both
//! streams are joined before the output is handed back.

use std::sync::Arc;

use tracing::debug;

use crate::allgather::{
    all_gather_full_mesh_pull, all_gather_push, inter_node_all_gather, AllGatherMethod,
    CORRECTNESS_DELAY,
};
use crate::config::TileConfig;
use crate::matrix::Matrix;
use crate::ops::{
    publish_local_shard_inter, publish_local_shard_intra, run_non_persistent, run_persistent,
    OutputSlab,
};
use crate::signal::{BarrierGroup, FlagBuffer};
use crate::stream::Stream;
use crate::swizzle::TileScheduler;
use crate::symm::SymmetricBuffer;
use crate::topology::RankLayout;
use crate::{Error, Result};

/// Flag value a segment is raised to when it lands.
const READY_VALUE: u32 = 1;

/// Construction-time options for a context group.
#[derive(Debug, Clone, Copy)]
pub struct ContextOptions {
    /// Workspace row capacity (upper bound on gathered M)
    pub max_m: usize,
    /// Tiling parameters for both kernel variants
    pub tile: TileConfig,
    /// Force a full stream join after the all-gather: linear replay
    /// for debugging, no overlap
    pub serial: bool,
    /// Inject transport delay to stress the flag protocol
    pub for_correctness: bool,
    /// Rank-aware tile rotation; disabling it must not change results
    pub swizzle: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_m: 1 << 14,
            tile: TileConfig::default(),
            serial: false,
            for_correctness: false,
            swizzle: true,
        }
    }
}

/// Per-rank execution context for fused all-gather GEMM calls.
pub struct AgGemmContext {
    layout: RankLayout,
    method: AllGatherMethod,
    opts: ContextOptions,
    workspaces: Vec<Arc<SymmetricBuffer>>,
    flags: Vec<Arc<FlagBuffer>>,
    staging: Vec<Arc<SymmetricBuffer>>,
    staging_flags: Vec<Arc<FlagBuffer>>,
    barrier: Arc<BarrierGroup>,
    ag_stream: Stream,
    gemm_stream: Stream,
    phase: u32,
}

impl AgGemmContext {
    /// Collectively create one context per rank.
    ///
    /// The single construction call is the rendezvous: all symmetric
    /// buffers exist before any context is handed out, so no rank can
    /// observe a peer's buffer mid-creation.
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] for a ragged node layout, a
    /// zero dimension, or invalid tile parameters.
    pub fn create_group(
        num_ranks: usize,
        ranks_per_node: usize,
        k: usize,
        opts: ContextOptions,
    ) -> Result<Vec<Self>> {
        // Layout validation covers rank-count/node divisibility.
        let layout0 = RankLayout::new(0, num_ranks, ranks_per_node)?;
        opts.tile.validate()?;
        if k == 0 || opts.max_m == 0 {
            return Err(Error::InvalidConfig(
                "workspace dimensions must be nonzero".into(),
            ));
        }

        let method = AllGatherMethod::auto_select(ranks_per_node, num_ranks);
        let workspaces = SymmetricBuffer::create_list(num_ranks, opts.max_m, k);
        let flags: Vec<_> = (0..num_ranks)
            .map(|_| Arc::new(FlagBuffer::new(num_ranks)))
            .collect();
        let num_nodes = layout0.num_nodes();
        let (staging, staging_flags) = if num_nodes > 1 {
            (
                SymmetricBuffer::create_list(num_nodes, opts.max_m, k),
                (0..num_nodes)
                    .map(|_| Arc::new(FlagBuffer::new(ranks_per_node)))
                    .collect(),
            )
        } else {
            (Vec::new(), Vec::new())
        };
        let barrier = Arc::new(BarrierGroup::create(num_ranks));

        debug!(num_ranks, ranks_per_node, ?method, "context group created");
        (0..num_ranks)
            .map(|rank| {
                Ok(Self {
                    layout: layout0.with_rank(rank),
                    method,
                    opts,
                    workspaces: workspaces.clone(),
                    flags: flags.clone(),
                    staging: staging.clone(),
                    staging_flags: staging_flags.clone(),
                    barrier: Arc::clone(&barrier),
                    ag_stream: Stream::new(&format!("ag-r{rank}")),
                    gemm_stream: Stream::new(&format!("gemm-r{rank}")),
                    phase: 1,
                })
            })
            .collect()
    }

    /// This context's rank layout.
    #[must_use]
    pub fn layout(&self) -> RankLayout {
        self.layout
    }

    /// The transport algorithm chosen at construction.
    #[must_use]
    pub fn method(&self) -> AllGatherMethod {
        self.method
    }

    /// Current phase counter value (advances by 2 per call).
    #[must_use]
    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Readiness-flag snapshot for this rank (test/diagnostic use).
    #[must_use]
    pub fn flag_snapshot(&self) -> Vec<u32> {
        self.flags[self.layout.rank].snapshot()
    }

    /// Fused all-gather GEMM.
    ///
    /// Gathers the row-sharded A (`a` is this rank's `[m_per_rank, k]`
    /// shard) across all ranks while computing `C = gathered_A x bᵀ`
    /// (`b` is this rank's `[n_per_rank, k]` column shard of B),
    /// returning this rank's `[M, n_per_rank]` output.
    ///
    /// `persistent` selects the looping kernel variant; both produce
    /// identical results.
    ///
    /// # Errors
    /// Returns an error on shape mismatch or workspace overflow,
    /// before any work is issued. A peer that never publishes hangs
    /// the call indefinitely, by contract.
    pub fn ag_gemm(&mut self, a: &Matrix, b: &Matrix, persistent: bool) -> Result<Matrix> {
        let rank = self.layout.rank;
        let dims = crate::ops::validate_shapes(a, b, self.layout.num_ranks, &self.workspaces[rank])?;
        let m_per_rank = a.rows();

        let phase = self.phase;
        // Two handshakes per call; a stale waiter from a pipelined
        // prior call can never be satisfied by this call's writes.
        self.phase += 2;

        // Idle -> LocalShardPublished.
        if self.layout.is_multi_node() {
            publish_local_shard_inter(
                self.layout,
                a,
                &self.workspaces[rank],
                &self.flags[rank],
                &self.staging_flags[self.layout.node_id()],
                &self.barrier,
                phase,
                READY_VALUE,
            );
        } else {
            publish_local_shard_intra(
                self.layout,
                a,
                &self.workspaces[rank],
                &self.flags[rank],
                &self.barrier,
                phase,
            );
        }

        // LocalShardPublished -> Gathering, on the transport stream.
        let delay = self.opts.for_correctness.then_some(CORRECTNESS_DELAY);
        let layout = self.layout;
        let method = self.method;
        let local = a.as_slice().to_vec();
        let workspaces = self.workspaces.clone();
        let flags = self.flags.clone();
        let staging = self.staging.clone();
        let staging_flags = self.staging_flags.clone();
        self.ag_stream.submit(move || match method {
            AllGatherMethod::All2AllPush => {
                all_gather_push(layout, &local, m_per_rank, &workspaces, &flags, delay);
            }
            AllGatherMethod::FullMeshPull => {
                all_gather_full_mesh_pull(layout, m_per_rank, &workspaces, &flags, delay);
            }
            AllGatherMethod::TwoTier => {
                inter_node_all_gather(
                    layout,
                    &local,
                    m_per_rank,
                    &workspaces,
                    &flags,
                    &staging,
                    &staging_flags,
                    delay,
                );
            }
        });

        if self.opts.serial {
            // Full join: transport strictly before compute.
            self.ag_stream.synchronize();
            debug!(rank, phase, "serial mode: all-gather joined");
        }

        // LocalShardPublished -> Computing, on the gemm stream. The
        // two streams race; each tile blocks on its own flag range.
        let sched = TileScheduler::new(
            dims.m,
            dims.n,
            m_per_rank,
            &self.opts.tile,
            self.layout,
            self.opts.swizzle,
        );
        let c = Arc::new(OutputSlab::new(dims.m, dims.n));
        let c_kernel = Arc::clone(&c);
        let ws = Arc::clone(&self.workspaces[rank]);
        let own_flags = Arc::clone(&self.flags[rank]);
        let b = b.clone();
        let tile = self.opts.tile;
        self.gemm_stream.submit(move || {
            if persistent {
                run_persistent(&ws, &b, &c_kernel, dims, &own_flags, &sched, &tile, READY_VALUE);
            } else {
                run_non_persistent(&ws, &b, &c_kernel, dims, &own_flags, &sched, &tile, READY_VALUE);
            }
        });

        // Gathering || Computing -> Complete: join both streams back.
        self.ag_stream.synchronize();
        self.gemm_stream.synchronize();
        debug!(rank, phase, "fused call complete");

        Arc::try_unwrap(c)
            .map(OutputSlab::into_matrix)
            .map_err(|_| Error::Other("output buffer still referenced after stream join".into()))
    }
}
