//! Benchmark errors.

use std::path::PathBuf;

use kiln_core::KilnError;

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error(transparent)]
    Kiln(#[from] KilnError),

    #[error("matrix shapes do not chain: ({lhs_rows}x{lhs_cols}) * ({rhs_rows}x{rhs_cols})")]
    ShapeMismatch { lhs_rows: usize, lhs_cols: usize, rhs_rows: usize, rhs_cols: usize },

    #[error("result matrix is {got_rows}x{got_cols}, expected {rows}x{cols}")]
    ResultShape { rows: usize, cols: usize, got_rows: usize, got_cols: usize },

    #[error("invalid benchmark configuration: {0}")]
    Config(String),

    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BenchError>;
