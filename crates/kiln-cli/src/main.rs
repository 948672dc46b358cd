use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_bench::{BenchConfig, BenchError, BenchReport, MATMUL_SOURCE};
use kiln_core::{read_kernel_source, Device, KilnError, Platform, RuntimeChoice, SharedRuntime};

#[derive(Parser)]
#[command(
    name = "kiln",
    about = "Kiln compute dispatch CLI",
    long_about = "Inspect OpenCL-style compute devices and benchmark matrix-multiplication\nkernels against a CPU reference.\n\nSet KILN_RUNTIME=opencl|host|auto to choose the runtime; RUST_LOG controls logging.",
    version
)]
struct Cli {
    /// Runtime to use: auto, opencl or host (default: $KILN_RUNTIME, else auto)
    #[arg(long, global = true)]
    runtime: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// List platforms and the capabilities of their devices
    Info,
    /// Time the CPU reference and each matmul kernel variant
    Bench {
        /// Kernel source file (default: the built-in matmul_v1/matmul_v2 source)
        source: Option<PathBuf>,
        /// JSON benchmark configuration; flags below override it
        #[arg(long)]
        config: Option<PathBuf>,
        /// Rows of the result
        #[arg(short)]
        m: Option<usize>,
        /// Columns of the result
        #[arg(short)]
        n: Option<usize>,
        /// Inner dimension
        #[arg(short)]
        k: Option<usize>,
        #[arg(long)]
        repeats: Option<usize>,
        /// Comma-separated kernel names
        #[arg(long, value_delimiter = ',')]
        variants: Option<Vec<String>>,
        /// Seed for random inputs (default: ramp inputs)
        #[arg(long)]
        seed: Option<u64>,
        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Kiln(#[from] KilnError),
    #[error(transparent)]
    Bench(#[from] BenchError),
    #[error("failed to encode reports: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = open(cli.runtime.as_deref()).and_then(|rt| match cli.command {
        Commands::Info => cmd_info(&rt),
        Commands::Bench { source, config, m, n, k, repeats, variants, seed, json } => {
            let overrides = Overrides { m, n, k, repeats, variants, seed };
            cmd_bench(&rt, source, config, overrides, json)
        }
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn open(runtime: Option<&str>) -> Result<SharedRuntime, CliError> {
    let choice = match runtime {
        Some(name) => name.parse::<RuntimeChoice>()?,
        None => RuntimeChoice::from_env(),
    };
    Ok(kiln_bench::open_runtime(choice)?)
}

fn cmd_info(rt: &SharedRuntime) -> Result<(), CliError> {
    let platforms = Platform::all(rt)?;
    if platforms.is_empty() {
        println!("No platforms found ({} runtime)", rt.name());
    }
    for (p, platform) in platforms.iter().enumerate() {
        println!("Platform {}: {}", p, platform.name()?);
        println!("  Vendor:  {}", platform.vendor()?);
        println!("  Version: {}", platform.version()?);

        for d in 0..platform.num_devices()? {
            let device = Device::new(platform, d)?;
            println!("Device {}: {}", d, device.name()?);
            println!("  Type: {}", device.device_type()?);
            println!("  Number of compute units: {}", device.compute_units()?);
            println!("  Max alloc. size: {}", device.max_alloc_size()?);
            println!("  Local memory size: {}", device.local_mem_size()?);
            println!("  Max work group size: {}", device.max_work_group_size()?);
            println!("  Max work item dimensions: {}", device.max_work_item_dimensions()?);
            let sizes: Vec<String> = device.max_work_item_sizes()?.iter().map(|s| s.to_string()).collect();
            println!("  Max work item sizes: ({})", sizes.join(", "));
            println!(
                "  FP16: {}  FP64: {}",
                if device.supports_fp16()? { "[x]" } else { "[ ]" },
                if device.supports_fp64()? { "[x]" } else { "[ ]" }
            );
        }
        println!("-------------------------------");
    }
    Ok(())
}

struct Overrides {
    m: Option<usize>,
    n: Option<usize>,
    k: Option<usize>,
    repeats: Option<usize>,
    variants: Option<Vec<String>>,
    seed: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut BenchConfig) {
        if let Some(m) = self.m {
            config.m = m;
        }
        if let Some(n) = self.n {
            config.n = n;
        }
        if let Some(k) = self.k {
            config.k = k;
        }
        if let Some(repeats) = self.repeats {
            config.repeats = repeats;
        }
        if let Some(variants) = self.variants {
            config.variants = variants;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
    }
}

fn cmd_bench(
    rt: &SharedRuntime,
    source: Option<PathBuf>,
    config: Option<PathBuf>,
    overrides: Overrides,
    json: bool,
) -> Result<(), CliError> {
    let mut config = match config {
        Some(path) => BenchConfig::from_json_file(path)?,
        None => BenchConfig::default(),
    };
    overrides.apply(&mut config);

    let source = match source {
        Some(path) => read_kernel_source(path)?,
        None => MATMUL_SOURCE.to_string(),
    };

    tracing::info!("bench {}x{}x{} on {} runtime", config.m, config.n, config.k, rt.name());
    let reports: Vec<BenchReport> = kiln_bench::run(rt, &config, &source)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            println!("{}\n", report);
        }
    }
    Ok(())
}
