//! Thread-per-rank fan-out over a context group.

use tilegather::{AgGemmContext, ContextOptions, Error, Result};

/// A group of per-rank contexts plus the thread fan-out to drive them.
///
/// Collective calls require every rank to participate, so the group
/// runs one scoped OS thread per rank and joins them all before
/// returning. Contexts live as long as the group and are reused across
/// calls.
pub struct RankGroup {
    contexts: Vec<AgGemmContext>,
}

impl RankGroup {
    /// Create a group of `num_ranks` contexts.
    ///
    /// # Errors
    /// Propagates construction errors from
    /// [`AgGemmContext::create_group`].
    pub fn new(
        num_ranks: usize,
        ranks_per_node: usize,
        k: usize,
        opts: ContextOptions,
    ) -> Result<Self> {
        Ok(Self {
            contexts: AgGemmContext::create_group(num_ranks, ranks_per_node, k, opts)?,
        })
    }

    #[must_use]
    pub fn num_ranks(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn contexts(&self) -> &[AgGemmContext] {
        &self.contexts
    }

    /// Run `f` on every rank concurrently and collect the results in
    /// rank order.
    ///
    /// All ranks must make the same sequence of collective calls
    /// inside `f`; a rank that skips one hangs its peers.
    ///
    /// # Errors
    /// Returns the first rank error encountered, or an error if a rank
    /// thread panicked.
    pub fn run<T, F>(&mut self, f: F) -> Result<Vec<T>>
    where
        F: Fn(usize, &mut AgGemmContext) -> Result<T> + Sync,
        T: Send,
    {
        std::thread::scope(|s| {
            let handles: Vec<_> = self
                .contexts
                .iter_mut()
                .enumerate()
                .map(|(rank, ctx)| {
                    let f = &f;
                    s.spawn(move || f(rank, ctx))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .map_err(|_| Error::Other("rank thread panicked".into()))?
                })
                .collect()
        })
    }
}
