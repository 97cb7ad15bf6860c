//! Local shard publish: the transition out of the idle state that
//! opens every fused call.
//!
//! Copies the caller's A-shard into its own workspace segment and
//! raises its own readiness flag, bracketed by the phased barrier so
//! that (a) no rank can still be polling last call's flags when they
//! are rewritten and (b) every rank's own segment is globally visible
//! before any transport starts reading peers.

use tracing::debug;

use crate::matrix::Matrix;
use crate::signal::{BarrierGroup, FlagBuffer};
use crate::symm::SymmetricBuffer;
use crate::topology::RankLayout;

/// Intra-node publish.
///
/// Flags are rewritten 0/1 each call (own slot 1, peers 0); temporal
/// isolation across calls comes from the barrier phase, which the
/// caller advances by 2 per invocation.
///
/// # Panics
/// Panics if the shard overflows this rank's workspace segment.
pub fn publish_local_shard_intra(
    layout: RankLayout,
    a: &Matrix,
    workspace: &SymmetricBuffer,
    flags: &FlagBuffer,
    barrier: &BarrierGroup,
    phase: u32,
) {
    barrier.arrive_and_wait(layout.rank, phase);
    workspace.write_rows(layout.rank * a.rows(), a.as_slice());
    for slot in 0..layout.num_ranks {
        flags.set(slot, u32::from(slot == layout.rank));
    }
    barrier.arrive_and_wait(layout.rank, phase + 1);
    debug!(rank = layout.rank, phase, "local shard published");
}

/// Inter-node publish.
///
/// Same bracket, but additionally clears this rank's staging-flag slot
/// so the two-tier transport starts from a clean node aggregate, and
/// raises the own flag to an explicit `signal_target`.
///
/// # Panics
/// Panics if the shard overflows this rank's workspace segment.
#[allow(clippy::too_many_arguments)]
pub fn publish_local_shard_inter(
    layout: RankLayout,
    a: &Matrix,
    workspace: &SymmetricBuffer,
    flags: &FlagBuffer,
    staging_flags: &FlagBuffer,
    barrier: &BarrierGroup,
    phase: u32,
    signal_target: u32,
) {
    barrier.arrive_and_wait(layout.rank, phase);
    flags.reset();
    staging_flags.set(layout.local_rank(), 0);
    workspace.write_rows(layout.rank * a.rows(), a.as_slice());
    flags.set(layout.rank, signal_target);
    barrier.arrive_and_wait(layout.rank, phase + 1);
    debug!(rank = layout.rank, phase, "local shard published (inter-node)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn intra_publish_sets_own_flag_only() {
        let num_ranks = 3;
        let barrier = Arc::new(BarrierGroup::create(num_ranks));
        let workspaces = SymmetricBuffer::create_list(num_ranks, 6, 2);
        let flags: Vec<_> = (0..num_ranks)
            .map(|_| Arc::new(FlagBuffer::all_set(num_ranks, 9))) // stale values
            .collect();

        std::thread::scope(|s| {
            for rank in 0..num_ranks {
                let barrier = Arc::clone(&barrier);
                let workspace = Arc::clone(&workspaces[rank]);
                let flags = Arc::clone(&flags[rank]);
                s.spawn(move || {
                    let layout = RankLayout::single_node(rank, num_ranks).unwrap();
                    let a = Matrix::from_vec(2, 2, vec![rank as f32; 4]);
                    publish_local_shard_intra(layout, &a, &workspace, &flags, &barrier, 1);
                });
            }
        });

        for rank in 0..num_ranks {
            let mut expect = vec![0; num_ranks];
            expect[rank] = 1;
            assert_eq!(flags[rank].snapshot(), expect);
            let seg = workspaces[rank].to_matrix(6);
            assert_eq!(seg.row(rank * 2), &[rank as f32, rank as f32]);
        }
    }

    #[test]
    fn inter_publish_resets_then_signals() {
        let num_ranks = 2;
        let barrier = Arc::new(BarrierGroup::create(num_ranks));
        let workspaces = SymmetricBuffer::create_list(num_ranks, 4, 2);
        let flags: Vec<_> = (0..num_ranks)
            .map(|_| Arc::new(FlagBuffer::all_set(num_ranks, 9)))
            .collect();
        let staging_flags = Arc::new(FlagBuffer::all_set(2, 9));

        std::thread::scope(|s| {
            for rank in 0..num_ranks {
                let barrier = Arc::clone(&barrier);
                let workspace = Arc::clone(&workspaces[rank]);
                let flags = Arc::clone(&flags[rank]);
                let staging_flags = Arc::clone(&staging_flags);
                s.spawn(move || {
                    let layout = RankLayout::new(rank, num_ranks, 2).unwrap();
                    let a = Matrix::from_vec(2, 2, vec![rank as f32; 4]);
                    publish_local_shard_inter(
                        layout,
                        &a,
                        &workspace,
                        &flags,
                        &staging_flags,
                        &barrier,
                        1,
                        1,
                    );
                });
            }
        });

        assert_eq!(flags[0].snapshot(), vec![1, 0]);
        assert_eq!(flags[1].snapshot(), vec![0, 1]);
        assert_eq!(staging_flags.snapshot(), vec![0, 0]);
    }
}
