//! Benchmark orchestration: CPU reference plus device kernel variants.

use std::fmt;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use kiln_core::{
    Buffer, CommandQueue, Context, Device, HostRuntime, Kernel, NdRange, Platform, Program, RuntimeChoice,
    SharedRuntime,
};

use crate::error::{BenchError, Result};
use crate::kernels::{host_library, MATMUL_V1, MATMUL_V2, TILE};
use crate::matrix::Matrix;
use crate::reference::{matmul_naive, mean_abs_error, ramp_inputs, random_inputs};

fn default_m() -> usize {
    1024
}

fn default_n() -> usize {
    1024
}

fn default_k() -> usize {
    8
}

fn default_repeats() -> usize {
    1
}

fn default_local() -> [usize; 2] {
    [2, 2]
}

fn default_variants() -> Vec<String> {
    vec![MATMUL_V1.to_string(), MATMUL_V2.to_string()]
}

/// Benchmark parameters, loadable from JSON. Missing fields take their
/// defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_repeats")]
    pub repeats: usize,
    /// Work-group shape of every dispatch.
    #[serde(default = "default_local")]
    pub local: [usize; 2],
    #[serde(default = "default_variants")]
    pub variants: Vec<String>,
    #[serde(default)]
    pub platform: usize,
    #[serde(default)]
    pub device: usize,
    #[serde(default)]
    pub build_options: Vec<String>,
    /// Seed for uniform random inputs; ramp inputs when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            m: default_m(),
            n: default_n(),
            k: default_k(),
            repeats: default_repeats(),
            local: default_local(),
            variants: default_variants(),
            platform: 0,
            device: 0,
            build_options: Vec::new(),
            seed: None,
        }
    }
}

impl BenchConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: BenchConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|source| BenchError::ConfigRead { path: path.to_path_buf(), source })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return Err(BenchError::Config(format!("sizes must be positive, got {}x{}x{}", self.m, self.n, self.k)));
        }
        if [self.m, self.n, self.k].iter().any(|&d| i32::try_from(d).is_err()) {
            return Err(BenchError::Config("sizes must fit in a 32-bit int".into()));
        }
        if self.repeats == 0 {
            return Err(BenchError::Config("repeats must be at least 1".into()));
        }
        if self.local.contains(&0) || self.m % self.local[0] != 0 || self.n % self.local[1] != 0 {
            return Err(BenchError::Config(format!(
                "work-group {:?} must evenly divide the {}x{} output",
                self.local, self.m, self.n
            )));
        }
        for variant in &self.variants {
            self.check_variant(variant)?;
        }
        Ok(())
    }

    /// Shape constraints a kernel variant places on the problem beyond the
    /// general ones. `matmul_v2` works in `TILE x TILE` work-groups and walks
    /// K a tile at a time.
    pub fn check_variant(&self, name: &str) -> Result<()> {
        if name == MATMUL_V2 {
            if self.local != [TILE, TILE] {
                return Err(BenchError::Config(format!(
                    "{} needs a {}x{} work-group, got {:?}",
                    name, TILE, TILE, self.local
                )));
            }
            if self.m % TILE != 0 || self.n % TILE != 0 || self.k % TILE != 0 {
                return Err(BenchError::Config(format!(
                    "{} needs sizes divisible by {}, got {}x{}x{}",
                    name, TILE, self.m, self.n, self.k
                )));
            }
        }
        Ok(())
    }

    /// `(lhs, rhs)` for this configuration.
    pub fn inputs(&self) -> (Matrix, Matrix) {
        match self.seed {
            Some(seed) => random_inputs(self.m, self.n, self.k, seed),
            None => ramp_inputs(self.m, self.n, self.k),
        }
    }
}

/// Timing and accuracy of one implementation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchReport {
    pub name: String,
    pub repeats: usize,
    /// Wall time summed over all repeats.
    pub total_seconds: f64,
    /// Mean absolute elementwise error against the reference, averaged over
    /// repeats.
    pub mean_error: f32,
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<<< {} bench results >>>", self.name)?;
        writeln!(f, "spent time: {} seconds", self.total_seconds)?;
        write!(f, "err.: {}", self.mean_error)
    }
}

/// Open `choice`, using a host runtime loaded with the matmul kernels when
/// the host is selected or OpenCL is unavailable.
pub fn open_runtime(choice: RuntimeChoice) -> kiln_core::Result<SharedRuntime> {
    choice.open(|| HostRuntime::with_library(host_library()))
}

/// A device with its context, queue and built program.
#[derive(Debug)]
pub struct Session {
    pub device: Device,
    pub context: Context,
    pub queue: CommandQueue,
    pub program: Program,
}

impl Session {
    pub fn open(
        runtime: &SharedRuntime,
        platform: usize,
        device: usize,
        source: &str,
        build_options: &[&str],
    ) -> Result<Session> {
        let platform = Platform::new(runtime, platform)?;
        let device = Device::new(&platform, device)?;
        let context = Context::new(&device)?;
        let queue = CommandQueue::new(&context, &device)?;
        let mut program = Program::from_source(&context, source)?;
        program.build(&device, build_options)?;
        tracing::info!("benchmarking on {} ({})", device.name()?, platform.name()?);
        Ok(Session { device, context, queue, program })
    }
}

/// Time the naive CPU product `repeats` times.
pub fn run_reference(lhs: &Matrix, rhs: &Matrix, reference: &Matrix, repeats: usize) -> Result<BenchReport> {
    let mut total_seconds = 0.0;
    let mut total_error = 0.0f32;
    for _ in 0..repeats {
        let mut result = Matrix::new(lhs.rows(), rhs.cols());
        let start = Instant::now();
        matmul_naive(lhs, rhs, &mut result)?;
        total_seconds += start.elapsed().as_secs_f64();
        total_error += mean_abs_error(result.as_slice(), reference.as_slice());
    }
    Ok(BenchReport {
        name: "naive".into(),
        repeats,
        total_seconds,
        mean_error: total_error / repeats.max(1) as f32,
    })
}

/// Run kernel `name` `config.repeats` times: upload, bind `(M, N, K, lhs,
/// rhs, result)`, dispatch over `M x N` with the configured work-group,
/// finish, read back and compare with `reference`.
///
/// The timed span runs from argument binding to the end of the read-back.
pub fn run_kernel_variant(
    session: &Session,
    name: &str,
    lhs: &Matrix,
    rhs: &Matrix,
    reference: &Matrix,
    config: &BenchConfig,
) -> Result<BenchReport> {
    let (m, n, k) = (lhs.rows(), rhs.cols(), lhs.cols());
    BenchConfig { m, n, k, ..config.clone() }.check_variant(name)?;
    let dims =
        |d: usize| i32::try_from(d).map_err(|_| BenchError::Config(format!("size {} does not fit in an int", d)));
    let (m_arg, n_arg, k_arg) = (dims(m)?, dims(n)?, dims(k)?);
    let range = NdRange::d2(m, n).with_local([config.local[0], config.local[1], 1]);

    let mut kernel = Kernel::new(&session.program, name)?;
    let mut total_seconds = 0.0;
    let mut total_error = 0.0f32;
    for repeat in 0..config.repeats {
        let mut results = vec![0.0f32; m * n];
        let device_lhs = Buffer::<f32>::new(&session.context, m * k)?;
        let device_rhs = Buffer::<f32>::new(&session.context, k * n)?;
        let device_result = Buffer::<f32>::new(&session.context, m * n)?;
        device_lhs.copy_from_host(&session.queue, lhs.as_slice(), 0, &[])?;
        device_rhs.copy_from_host(&session.queue, rhs.as_slice(), 0, &[])?;

        let start = Instant::now();
        kernel.set_arguments(&[&m_arg, &n_arg, &k_arg, &device_lhs, &device_rhs, &device_result])?;
        kernel.run(&session.queue, &range, &[])?;
        session.queue.finish()?;
        device_result.copy_from_device(&session.queue, &mut results, 0, &[])?;
        let elapsed = start.elapsed().as_secs_f64();

        let error = mean_abs_error(&results, reference.as_slice());
        tracing::debug!("{} repeat {}: {:.6}s, error {}", name, repeat, elapsed, error);
        total_seconds += elapsed;
        total_error += error;
    }
    Ok(BenchReport {
        name: name.to_string(),
        repeats: config.repeats,
        total_seconds,
        mean_error: total_error / config.repeats.max(1) as f32,
    })
}

/// The full protocol: reference first, then every configured variant on
/// one session.
pub fn run(runtime: &SharedRuntime, config: &BenchConfig, source: &str) -> Result<Vec<BenchReport>> {
    config.validate()?;
    let (lhs, rhs) = config.inputs();
    let mut reference = Matrix::new(config.m, config.n);
    matmul_naive(&lhs, &rhs, &mut reference)?;

    let mut reports = vec![run_reference(&lhs, &rhs, &reference, config.repeats)?];

    let options: Vec<&str> = config.build_options.iter().map(String::as_str).collect();
    let session = Session::open(runtime, config.platform, config.device, source, &options)?;
    for variant in &config.variants {
        reports.push(run_kernel_variant(&session, variant, &lhs, &rhs, &reference, config)?);
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BenchConfig::default();
        assert_eq!((config.m, config.n, config.k), (1024, 1024, 8));
        assert_eq!(config.repeats, 1);
        assert_eq!(config.local, [2, 2]);
        assert_eq!(config.variants, vec!["matmul_v1", "matmul_v2"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = BenchConfig::from_json_str(r#"{ "m": 64, "n": 32, "seed": 3 }"#).unwrap();
        assert_eq!((config.m, config.n, config.k), (64, 32, 8));
        assert_eq!(config.seed, Some(3));
        assert_eq!(config.variants.len(), 2);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(matches!(BenchConfig::from_json_str(r#"{ "repeats": 0 }"#), Err(BenchError::Config(_))));
        assert!(matches!(BenchConfig::from_json_str(r#"{ "m": 7 }"#), Err(BenchError::Config(_))));
        assert!(matches!(BenchConfig::from_json_str("{ m: 1 }"), Err(BenchError::ConfigParse(_))));
    }

    #[test]
    fn test_report_display() {
        let report = BenchReport { name: "matmul_v1".into(), repeats: 1, total_seconds: 0.5, mean_error: 0.0 };
        assert_eq!(report.to_string(), "<<< matmul_v1 bench results >>>\nspent time: 0.5 seconds\nerr.: 0");
    }
}
