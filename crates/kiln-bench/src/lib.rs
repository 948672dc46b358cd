//! # kiln-bench
//!
//! Matrix-multiplication dispatch benchmark built on `kiln-core`.
//!
//! Provides:
//! - A column-major host [`Matrix`]
//! - Naive and tiled CPU reference products
//! - The `matmul_v1`/`matmul_v2` kernel source with host implementations
//! - [`run`], which times the reference and each kernel variant and
//!   reports mean absolute error

pub mod bench;
pub mod error;
pub mod kernels;
pub mod matrix;
pub mod reference;

pub use bench::{open_runtime, run, run_kernel_variant, run_reference, BenchConfig, BenchReport, Session};
pub use error::{BenchError, Result};
pub use kernels::{host_library, MATMUL_SOURCE};
pub use matrix::Matrix;
