use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fuse_core::{Device, Result, SimdTier, Tensor};
use fuse_fast::{
    affine_dequantize, affine_quantize, layer_norm, rms_norm, rope, Array, Context,
    DispatchConfig, RopeParams,
};

#[derive(Parser)]
#[command(
    name = "fuse",
    about = "Fused operator probe and benchmark driver",
    long_about = "Inspect the devices the fused operators can dispatch to, time the fused\nkernels against their decompositions, and check the affine quantization codec.",
    version
)]
struct Cli {
    /// Dispatch configuration (JSON). Missing fields take their defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show device capabilities and the active dispatch configuration
    Info,
    /// Time fused operators against their decompositions
    Bench {
        /// Row counts to benchmark (comma-separated)
        #[arg(long, default_value = "64,256,1024")]
        rows: String,
        /// Feature dimension of every row
        #[arg(long, default_value = "512")]
        dim: usize,
    },
    /// Quantize a seeded random matrix and report the reconstruction error
    Quantize {
        #[arg(long, default_value = "64")]
        rows: usize,
        #[arg(long, default_value = "512")]
        cols: usize,
        #[arg(long, default_value = "64")]
        group_size: i32,
        #[arg(long, default_value = "4")]
        bits: i32,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => match DispatchConfig::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => DispatchConfig::default(),
    };
    tracing::debug!(?config, "dispatch configuration");

    let result = match cli.command {
        Commands::Info => cmd_info(&config),
        Commands::Bench { rows, dim } => cmd_bench(&config, &rows, dim),
        Commands::Quantize { rows, cols, group_size, bits, seed } => {
            cmd_quantize(&config, rows, cols, group_size, bits, seed)
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn mark(flag: bool) -> &'static str {
    if flag { "[x]" } else { "[ ]" }
}

fn cmd_info(config: &DispatchConfig) -> Result<()> {
    println!("fuse v{}\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);
    println!("  SIMD: {}", SimdTier::detect());

    println!("\nDevices");
    for device in [Device::Cpu, Device::Cuda(0)] {
        let caps = device.caps();
        println!(
            "  {:<8} fused kernels {}  kernel compilation {}",
            device.to_string(),
            mark(caps.fused_kernels),
            mark(caps.kernel_compilation),
        );
    }
    #[cfg(feature = "cuda")]
    println!("  CUDA devices found: {}", fuse_kernels::cuda::device_count());
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA support not compiled in (build with --features cuda)");

    println!("\nDispatch");
    println!("  norms:              {}", mark(config.fused_norms));
    println!("  rope:               {}", mark(config.fused_rope));
    println!("  quantize:           {}", mark(config.fused_quantize));
    println!("  custom kernels:     {}", mark(config.custom_kernels));
    println!("  sdpa decode:        {}", mark(config.attention.fused_decode));
    println!("  sdpa self-attn:     {}", mark(config.attention.fused_self_attention));
    if let Ok(json) = serde_json::to_string(config) {
        println!("\n  {json}");
    }
    Ok(())
}

fn time_it(iters: usize, mut f: impl FnMut() -> Result<()>) -> Result<f64> {
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() / iters as f64)
}

fn cmd_bench(config: &DispatchConfig, rows_str: &str, dim: usize) -> Result<()> {
    let rows: Vec<usize> = rows_str
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    let fused = Context::default().with_config(config.clone());
    let eager = Context::fallback_only();

    println!("=== Fused vs Decomposed (dim={dim}, SIMD {}) ===\n", SimdTier::detect());
    println!("{:<12} {:<10} {:>12} {:>12} {:>9}", "Op", "Rows", "Fused (ms)", "Eager (ms)", "Speedup");
    println!("{}", "-".repeat(59));

    for &n in &rows {
        let x = Array::from(Tensor::randn_seeded(&[1, n, dim], 1));
        let w = Array::from(Tensor::randn_seeded(&[dim], 2));
        let b = Array::from(Tensor::randn_seeded(&[dim], 3));
        let iters = if n <= 128 { 50 } else if n <= 512 { 10 } else { 3 };

        let cases: [(&str, Box<dyn Fn(&Context) -> Result<()> + '_>); 4] = [
            ("rms_norm", Box::new(|ctx: &Context| rms_norm(&x, &w, 1e-5, ctx)?.eval().map(drop))),
            ("layer_norm", Box::new(|ctx: &Context| layer_norm(&x, Some(&w), Some(&b), 1e-5, ctx)?.eval().map(drop))),
            ("rope", Box::new(|ctx: &Context| rope(&x, RopeParams::new(dim), ctx)?.eval().map(drop))),
            ("quantize", Box::new(|ctx: &Context| {
                let (packed, _, _) = affine_quantize(&x, 64, 4, ctx)?;
                packed.eval().map(drop)
            })),
        ];

        for (name, run) in &cases {
            // warmup
            run(&fused)?;
            run(&eager)?;
            let fused_s = time_it(iters, || run(&fused))?;
            let eager_s = time_it(iters, || run(&eager))?;
            println!(
                "{:<12} {:<10} {:>10.3}ms {:>10.3}ms {:>8.1}x",
                name,
                n,
                fused_s * 1000.0,
                eager_s * 1000.0,
                eager_s / fused_s,
            );
        }
    }
    Ok(())
}

fn cmd_quantize(
    config: &DispatchConfig,
    rows: usize,
    cols: usize,
    group_size: i32,
    bits: i32,
    seed: u64,
) -> Result<()> {
    let ctx = Context::default().with_config(config.clone());
    let w = Tensor::randn_seeded(&[rows, cols], seed);

    let start = Instant::now();
    let (packed, scales, biases) = affine_quantize(&Array::from(&w), group_size, bits, &ctx)?;
    let back = affine_dequantize(&packed, &scales, &biases, group_size, bits, &ctx)?.eval()?;
    let elapsed = start.elapsed();

    let err = back.sub(&w)?.abs()?;
    let max_err = err.max_axes(&[0, 1], false)?.item()?;
    let mean_err = err.mean()?.item()?;
    let packed_bytes = packed.eval()?.dtype().storage_bytes(packed.shape().numel());

    println!("=== Affine Quantization ===");
    println!("Matrix:     {rows}x{cols} (seed {seed})");
    println!("Params:     group_size={group_size} bits={bits} fused={}", packed.is_pending());
    println!("Packed:     {:?} u32 ({:.1} KB)", packed.dims(), packed_bytes as f64 / 1024.0);
    println!("Scales:     {:?} {}", scales.dims(), scales.dtype());
    println!("Biases:     {:?} {}", biases.dims(), biases.dtype());
    println!("Max error:  {max_err:.6}");
    println!("Mean error: {mean_err:.6}");
    println!("Time:       {:.3}ms", elapsed.as_secs_f64() * 1000.0);
    Ok(())
}
