//! Run a fused all-gather GEMM across a simulated rank group and check
//! it against the dense reference.
//!
//! ```sh
//! cargo run --example overlap_demo -- --ranks 4 --m 256 --n 128 --k 64
//! cargo run --example overlap_demo -- --ranks 8 --ranks-per-node 4 --persistent
//! cargo run --example overlap_demo -- --tune
//! ```

use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};

use tilegather::{ContextOptions, Matrix, TileConfig};
use tilegather_runtime::{autotune, reference, AgGemmEngine};
use tilegather_runtime::autotune::TuneShape;

#[derive(Parser)]
#[command(about = "Fused all-gather GEMM demo")]
struct Args {
    /// Total ranks in the group
    #[arg(long, default_value_t = 4)]
    ranks: usize,

    /// Ranks per node (equal to --ranks for a single node)
    #[arg(long)]
    ranks_per_node: Option<usize>,

    /// Gathered rows of A
    #[arg(long, default_value_t = 256)]
    m: usize,

    /// Columns of the output (rows of B)
    #[arg(long, default_value_t = 128)]
    n: usize,

    /// Reduction depth
    #[arg(long, default_value_t = 64)]
    k: usize,

    /// Use the persistent kernel variant
    #[arg(long)]
    persistent: bool,

    /// Linear replay (join the gather before computing)
    #[arg(long)]
    serial: bool,

    /// Inject transport delay to stress the flag protocol
    #[arg(long)]
    for_correctness: bool,

    /// Search tile configurations instead of a single run
    #[arg(long)]
    tune: bool,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Matrix {
    let data = (0..rows * cols).map(|_| rng.gen_range(-1.0..1.0)).collect();
    Matrix::from_vec(rows, cols, data)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let ranks_per_node = args.ranks_per_node.unwrap_or(args.ranks);

    if args.tune {
        let shape = TuneShape {
            num_ranks: args.ranks,
            ranks_per_node,
            m: args.m,
            n: args.n,
            k: args.k,
        };
        let report = autotune(shape, args.persistent, 3)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let opts = ContextOptions {
        max_m: args.m,
        tile: TileConfig::default(),
        serial: args.serial,
        for_correctness: args.for_correctness,
        swizzle: true,
    };
    let mut engine = AgGemmEngine::new(args.ranks, ranks_per_node, args.k, opts)?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let a = random_matrix(&mut rng, args.m, args.k);
    let b = random_matrix(&mut rng, args.n, args.k);

    let start = std::time::Instant::now();
    let c = engine.multiply(&a, &b, args.persistent)?;
    let elapsed = start.elapsed();

    let expected = reference::matmul_nt(&a, &b);
    if c == expected {
        println!(
            "ok: [{}x{}] x [{}x{}]ᵀ over {} ranks in {elapsed:?}, bitwise equal to reference",
            args.m, args.k, args.n, args.k, args.ranks
        );
        Ok(())
    } else {
        Err("output diverged from reference".into())
    }
}
