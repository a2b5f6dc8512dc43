use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;

use tilec::diagnostic::render_plain;
use tilec::ir::display::listing;
use tilec::ir::Kernel;
use tilec::kernels::{self, MatmulConfig};
use tilec::schedule::simulate::SimOptions;
use tilec::target::{TargetCaps, BUILTIN_TARGETS};
use tilec::tensor::TensorSupply;
use tilec::CompileOptions;

#[derive(Parser)]
#[command(
    name = "tilec",
    version,
    about = "tilec: tile layout resolution and pipeline scheduling"
)]
struct Cli {
    /// Log pass decisions (same as RUST_LOG=debug)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Infer layouts, schedule pipelines and select strategies for a kernel
    Build {
        /// Input kernel (.json)
        input: PathBuf,
        /// Output annotated kernel (default: <input>.out.json)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the annotated listing
        #[arg(long)]
        listing: bool,
        /// Target (built-in name, `auto`, or targets/<name>.toml)
        #[arg(long, default_value = "sm80")]
        target: String,
    },
    /// Run every pass and report diagnostics only
    Check {
        /// Input kernel (.json)
        input: PathBuf,
        #[arg(long, default_value = "sm80")]
        target: String,
    },
    /// Compile, then simulate staged against sequential execution
    Verify {
        /// Input kernel (.json)
        input: PathBuf,
        #[arg(long, default_value = "sm80")]
        target: String,
        /// Input contents: integer, uniform, normal, randn, zero, one
        #[arg(long, default_value = "integer")]
        supply: String,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Simulate only the first N blocks in launch order (0 = all)
        #[arg(long, default_value_t = 4)]
        blocks: u64,
    },
    /// Compile a built-in reference kernel
    Demo {
        #[command(subcommand)]
        kernel: Demo,
    },
    /// List built-in targets
    Targets,
}

#[derive(Subcommand)]
enum Demo {
    /// Block-tiled C = A · Bᵀ
    Matmul {
        #[arg(long, default_value_t = 1024)]
        m: u32,
        #[arg(long, default_value_t = 1024)]
        n: u32,
        #[arg(long, default_value_t = 1024)]
        k: u32,
        #[arg(long, default_value_t = 128)]
        block_m: u32,
        #[arg(long, default_value_t = 128)]
        block_n: u32,
        #[arg(long, default_value_t = 32)]
        block_k: u32,
        #[arg(long, default_value_t = 3)]
        stages: u32,
        #[arg(long, default_value_t = 128)]
        threads: u32,
        #[arg(long, default_value = "sm80")]
        target: String,
        /// Also run the schedule simulator
        #[arg(long)]
        verify: bool,
        /// Write the annotated kernel as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Build {
            input,
            output,
            listing,
            target,
        } => cmd_build(&input, output, listing, &target),
        Command::Check { input, target } => cmd_check(&input, &target),
        Command::Verify {
            input,
            target,
            supply,
            seed,
            blocks,
        } => cmd_verify(&input, &target, &supply, seed, blocks),
        Command::Demo {
            kernel:
                Demo::Matmul {
                    m,
                    n,
                    k,
                    block_m,
                    block_n,
                    block_k,
                    stages,
                    threads,
                    target,
                    verify,
                    output,
                },
        } => {
            let cfg = MatmulConfig {
                m,
                n,
                k,
                block_m,
                block_n,
                block_k,
                stages,
                threads,
                ..MatmulConfig::default()
            };
            cmd_demo_matmul(&cfg, &target, verify, output);
        }
        Command::Targets => cmd_targets(),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if verbose { "debug" } else { "warn" };
    let filter = if verbose {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn options(target: &str) -> CompileOptions {
    match CompileOptions::for_target(target) {
        Ok(o) => o,
        Err(e) => {
            render_plain(&e);
            process::exit(1);
        }
    }
}

fn load(input: &Path) -> Kernel {
    match tilec::load_kernel(input) {
        Ok(k) => k,
        Err(e) => {
            render_plain(&e);
            process::exit(1);
        }
    }
}

// --- tilec build ---

fn cmd_build(input: &Path, output: Option<PathBuf>, show_listing: bool, target: &str) {
    let options = options(target);
    let kernel = load(input);
    let compiled = match tilec::compile_with_options(kernel, &options) {
        Ok(c) => c,
        Err(_) => process::exit(1),
    };
    if show_listing {
        print!("{}", listing(&compiled.kernel).text);
    }
    let out_path = output.unwrap_or_else(|| input.with_extension("out.json"));
    if let Err(e) = tilec::save_kernel(&compiled.kernel, &out_path) {
        render_plain(&e);
        process::exit(1);
    }
    eprintln!(
        "Compiled {} for {} -> {} ({})",
        compiled.kernel.name,
        options.target.name,
        out_path.display(),
        &compiled.fingerprint[..16]
    );
}

// --- tilec check ---

fn cmd_check(input: &Path, target: &str) {
    let options = options(target);
    let kernel = load(input);
    match tilec::check(kernel, &options) {
        Ok(warnings) if warnings.is_empty() => eprintln!("OK: {}", input.display()),
        Ok(warnings) => eprintln!("OK: {} ({} warnings)", input.display(), warnings.len()),
        Err(_) => process::exit(1),
    }
}

// --- tilec verify ---

fn cmd_verify(input: &Path, target: &str, supply: &str, seed: u64, blocks: u64) {
    let supply: TensorSupply = match supply.parse() {
        Ok(s) => s,
        Err(msg) => {
            eprintln!("error: {}", msg);
            process::exit(1);
        }
    };
    let options = options(target);
    let kernel = load(input);
    let sim = SimOptions {
        supply,
        seed,
        max_blocks: (blocks > 0).then_some(blocks),
    };
    match tilec::verify(kernel, &options, &sim) {
        Ok(v) => eprintln!(
            "OK: {} blocks, {} pipelined regions, {} elements match",
            v.blocks, v.regions, v.compared
        ),
        Err(_) => process::exit(1),
    }
}

// --- tilec demo matmul ---

fn cmd_demo_matmul(cfg: &MatmulConfig, target: &str, verify: bool, output: Option<PathBuf>) {
    let mut options = options(target);
    options.verify_schedule = verify;
    let compiled = match tilec::compile_with_options(kernels::matmul(cfg), &options) {
        Ok(c) => c,
        Err(_) => process::exit(1),
    };
    print!("{}", listing(&compiled.kernel).text);
    if verify {
        eprintln!("schedule verified against sequential execution");
    }
    if let Some(path) = output {
        if let Err(e) = tilec::save_kernel(&compiled.kernel, &path) {
            render_plain(&e);
            process::exit(1);
        }
    }
}

// --- tilec targets ---

fn cmd_targets() {
    for name in BUILTIN_TARGETS {
        if let Some(caps) = TargetCaps::builtin(name) {
            let bulk = caps
                .bulk_copy
                .map(|b| b.engine.name())
                .unwrap_or("none");
            println!(
                "{:<8} {:<18} warp={:<3} smem={:>4}KiB bulk={:<8} mma={}",
                caps.name,
                caps.display_name,
                caps.warp_size,
                caps.shared.capacity_bytes / 1024,
                bulk,
                caps.mma.len()
            );
        }
    }
}
