//! All-gather transport engines.
//!
//! Gets every rank's local A-shard into every rank's workspace,
//! raising one readiness flag per landed segment so the consumer GEMM
//! can start on a segment the instant it arrives. Three algorithms:
//!
//! - [`All2AllPush`](AllGatherMethod::All2AllPush): the producer
//!   writes its shard into every peer's workspace.
//! - [`FullMeshPull`](AllGatherMethod::FullMeshPull): each rank pulls
//!   every peer's already-published segment, trading producer-side
//!   contention for pull-side fan-in.
//! - [`TwoTier`](AllGatherMethod::TwoTier): hierarchical inter-node
//!   scheme: gather into a per-node staging slab, exchange whole
//!   node aggregates (one transfer per node pair instead of per rank
//!   pair), then fan out within the receiving node.
//!
//! Every transport assumes the publish step has already completed on
//! all ranks (its barrier bracket makes each rank's own segment
//! globally visible), so local segments can be read without a flag
//! wait. Peer flags are raised only after the corresponding segment
//! write, with release ordering.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::signal::FlagBuffer;
use crate::symm::SymmetricBuffer;
use crate::topology::RankLayout;

/// Which all-gather algorithm a context uses. Chosen once at context
/// construction, never re-decided per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllGatherMethod {
    /// Producer pushes its shard into every peer's workspace.
    All2AllPush,
    /// Every rank pulls each peer's published segment.
    FullMeshPull,
    /// Node-level staging exchange, then intra-node fan-out.
    TwoTier,
}

impl AllGatherMethod {
    /// Pick an algorithm from the topology.
    ///
    /// Multi-node groups take the hierarchical path. Small single-node
    /// groups are latency-bound and favor the pull variant; larger
    /// ones are bandwidth-bound and favor the push.
    #[must_use]
    pub fn auto_select(num_local_ranks: usize, num_ranks: usize) -> Self {
        if num_ranks > num_local_ranks {
            Self::TwoTier
        } else if num_ranks <= 4 {
            Self::FullMeshPull
        } else {
            Self::All2AllPush
        }
    }
}

/// Per-segment sleep injected in `for_correctness` mode, to surface
/// ordering bugs that only manifest under skewed transport timing.
pub const CORRECTNESS_DELAY: Duration = Duration::from_millis(2);

fn maybe_delay(delay: Option<Duration>) {
    if let Some(d) = delay {
        std::thread::sleep(d);
    }
}

/// Push transport: write `local` (this rank's shard, `m_per_rank`
/// rows) into every peer's workspace segment, raising the peer-side
/// flag for this rank after each write.
///
/// Peers are visited in `(rank + i) % num_ranks` order so no single
/// peer sees every producer arrive at once.
///
/// # Panics
/// Panics if buffer counts don't match the layout.
pub fn all_gather_push(
    layout: RankLayout,
    local: &[f32],
    m_per_rank: usize,
    workspaces: &[Arc<SymmetricBuffer>],
    flags: &[Arc<FlagBuffer>],
    delay: Option<Duration>,
) {
    assert_eq!(workspaces.len(), layout.num_ranks);
    assert_eq!(flags.len(), layout.num_ranks);
    let rank = layout.rank;
    let row0 = rank * m_per_rank;
    for i in 1..layout.num_ranks {
        let peer = (rank + i) % layout.num_ranks;
        maybe_delay(delay);
        workspaces[peer].write_rows(row0, local);
        flags[peer].set(rank, 1);
        trace!(rank, peer, "push: segment delivered");
    }
}

/// Pull transport: copy every peer's published local segment out of
/// the peer's workspace into this rank's own, raising this rank's own
/// flag for the segment on arrival.
///
/// # Panics
/// Panics if buffer counts don't match the layout.
pub fn all_gather_full_mesh_pull(
    layout: RankLayout,
    m_per_rank: usize,
    workspaces: &[Arc<SymmetricBuffer>],
    flags: &[Arc<FlagBuffer>],
    delay: Option<Duration>,
) {
    assert_eq!(workspaces.len(), layout.num_ranks);
    assert_eq!(flags.len(), layout.num_ranks);
    let rank = layout.rank;
    for i in 1..layout.num_ranks {
        let src = (rank + i) % layout.num_ranks;
        maybe_delay(delay);
        workspaces[src].relay_rows_to(&workspaces[rank], src * m_per_rank, m_per_rank);
        flags[rank].set(src, 1);
        trace!(rank, src, "pull: segment fetched");
    }
}

/// Hierarchical inter-node transport.
///
/// 1. Intra-node: deliver this rank's shard to every local peer's
///    workspace and into the node staging slab, then raise the
///    staging flag for this local rank.
/// 2. Inter-node: for each remote node this local rank is responsible
///    for, wait until the remote staging slab is complete, then copy
///    the whole node aggregate across, one transfer per node pair.
/// 3. Fan-out: replicate the received aggregate into every local
///    rank's workspace, raising one flag per source rank.
///
/// Remote nodes are assigned to local ranks round-robin, so up to
/// `ranks_per_node` node-pair transfers proceed in parallel.
///
/// # Panics
/// Panics if buffer counts don't match the layout.
#[allow(clippy::too_many_arguments)]
pub fn inter_node_all_gather(
    layout: RankLayout,
    local: &[f32],
    m_per_rank: usize,
    workspaces: &[Arc<SymmetricBuffer>],
    flags: &[Arc<FlagBuffer>],
    staging: &[Arc<SymmetricBuffer>],
    staging_flags: &[Arc<FlagBuffer>],
    delay: Option<Duration>,
) {
    assert_eq!(workspaces.len(), layout.num_ranks);
    assert_eq!(flags.len(), layout.num_ranks);
    assert_eq!(staging.len(), layout.num_nodes());
    assert_eq!(staging_flags.len(), layout.num_nodes());

    let rank = layout.rank;
    let rpn = layout.ranks_per_node;
    let node = layout.node_id();
    let local_rank = layout.local_rank();
    let node_base = node * rpn;
    let row0 = rank * m_per_rank;

    // Tier 1: local dissemination + staging contribution.
    staging[node].write_rows(row0, local);
    staging_flags[node].set(local_rank, 1);
    for i in 1..rpn {
        let peer = node_base + (local_rank + i) % rpn;
        maybe_delay(delay);
        workspaces[peer].write_rows(row0, local);
        flags[peer].set(rank, 1);
    }
    trace!(rank, node, "two-tier: local pass done");

    // Tier 2 + 3: pull remote node aggregates and fan them out.
    for j in 1..layout.num_nodes() {
        let remote = (node + j) % layout.num_nodes();
        if (j - 1) % rpn != local_rank {
            continue;
        }
        let agg_row0 = remote * rpn * m_per_rank;
        let agg_rows = rpn * m_per_rank;

        let _token = staging_flags[remote].wait_range(0, rpn, 1);
        maybe_delay(delay);
        staging[remote].relay_rows_to(&staging[node], agg_row0, agg_rows);
        trace!(rank, remote, "two-tier: node aggregate received");

        for p in 0..rpn {
            let peer = node_base + p;
            staging[node].relay_rows_to(&workspaces[peer], agg_row0, agg_rows);
            for src in remote * rpn..(remote + 1) * rpn {
                flags[peer].set(src, 1);
            }
        }
        trace!(rank, remote, "two-tier: fan-out done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_select_by_topology() {
        assert_eq!(
            AllGatherMethod::auto_select(4, 8),
            AllGatherMethod::TwoTier
        );
        assert_eq!(
            AllGatherMethod::auto_select(2, 2),
            AllGatherMethod::FullMeshPull
        );
        assert_eq!(
            AllGatherMethod::auto_select(8, 8),
            AllGatherMethod::All2AllPush
        );
    }

    // Transport correctness is covered end-to-end in the runtime
    // crate's integration tests; here we check the single-threaded
    // data movement and flag pattern of each engine.

    fn setup(num_ranks: usize, m_per_rank: usize, k: usize) -> (Vec<Arc<SymmetricBuffer>>, Vec<Arc<FlagBuffer>>) {
        let workspaces = SymmetricBuffer::create_list(num_ranks, num_ranks * m_per_rank, k);
        let flags: Vec<_> = (0..num_ranks)
            .map(|_| Arc::new(FlagBuffer::new(num_ranks)))
            .collect();
        (workspaces, flags)
    }

    fn shard(rank: usize, len: usize) -> Vec<f32> {
        (0..len).map(|i| (rank * 100 + i) as f32).collect()
    }

    #[test]
    fn push_lands_segments_and_flags() {
        let (workspaces, flags) = setup(3, 2, 2);
        for rank in 0..3 {
            let layout = RankLayout::single_node(rank, 3).unwrap();
            let local = shard(rank, 4);
            // Publish step stand-in: own segment + own flag.
            workspaces[rank].write_rows(rank * 2, &local);
            flags[rank].set(rank, 1);
            all_gather_push(layout, &local, 2, &workspaces, &flags, None);
        }
        for rank in 0..3 {
            assert_eq!(flags[rank].snapshot(), vec![1, 1, 1]);
            let gathered = workspaces[rank].to_matrix(6);
            for src in 0..3 {
                assert_eq!(gathered.row(src * 2)[0], (src * 100) as f32);
            }
        }
    }

    #[test]
    fn pull_fetches_published_segments() {
        let (workspaces, flags) = setup(3, 2, 2);
        // All ranks publish first (the barrier bracket guarantees this
        // ordering in the real flow).
        for rank in 0..3 {
            workspaces[rank].write_rows(rank * 2, &shard(rank, 4));
            flags[rank].set(rank, 1);
        }
        for rank in 0..3 {
            let layout = RankLayout::single_node(rank, 3).unwrap();
            all_gather_full_mesh_pull(layout, 2, &workspaces, &flags, None);
        }
        for rank in 0..3 {
            assert_eq!(flags[rank].snapshot(), vec![1, 1, 1]);
            let gathered = workspaces[rank].to_matrix(6);
            for src in 0..3 {
                assert_eq!(gathered.row(src * 2)[0], (src * 100) as f32);
            }
        }
    }

    #[test]
    fn two_tier_gathers_across_nodes() {
        let (num_ranks, rpn, m_per_rank, k) = (4, 2, 2, 2);
        let (workspaces, flags) = setup(num_ranks, m_per_rank, k);
        let staging = SymmetricBuffer::create_list(2, num_ranks * m_per_rank, k);
        let staging_flags: Vec<_> = (0..2).map(|_| Arc::new(FlagBuffer::new(rpn))).collect();

        let shards: Vec<_> = (0..num_ranks).map(|r| shard(r, m_per_rank * k)).collect();
        for rank in 0..num_ranks {
            workspaces[rank].write_rows(rank * m_per_rank, &shards[rank]);
            flags[rank].set(rank, 1);
        }
        // Tier 2 waits on the remote node's staging flags, so ranks
        // must run concurrently, as they do on real hardware.
        std::thread::scope(|s| {
            for rank in 0..num_ranks {
                let (workspaces, flags) = (&workspaces, &flags);
                let (staging, staging_flags) = (&staging, &staging_flags);
                let shards = &shards;
                s.spawn(move || {
                    let layout = RankLayout::new(rank, num_ranks, rpn).unwrap();
                    inter_node_all_gather(
                        layout,
                        &shards[rank],
                        m_per_rank,
                        workspaces,
                        flags,
                        staging,
                        staging_flags,
                        None,
                    );
                });
            }
        });
        for rank in 0..num_ranks {
            assert_eq!(flags[rank].snapshot(), vec![1; num_ranks]);
            let gathered = workspaces[rank].to_matrix(num_ranks * m_per_rank);
            for src in 0..num_ranks {
                assert_eq!(
                    gathered.row(src * m_per_rank),
                    &shards[src][..k],
                    "rank {rank} missing segment {src}"
                );
            }
        }
    }
}
