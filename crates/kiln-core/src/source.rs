//! Loading kernel source text from disk.

use std::path::Path;

use crate::error::{KilnError, Result};

/// Read a whole kernel source file as UTF-8.
pub fn read_kernel_source(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|source| KilnError::Source { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file() {
        let err = read_kernel_source("/nonexistent/kiln/matmul.cl").unwrap_err();
        assert!(matches!(err, KilnError::Source { .. }));
        assert!(err.to_string().contains("/nonexistent/kiln/matmul.cl"));
    }

    #[test]
    fn test_reads_whole_file() {
        let path = std::env::temp_dir().join(format!("kiln-source-{}.cl", std::process::id()));
        std::fs::write(&path, "__kernel void k() {}\n").unwrap();
        assert_eq!(read_kernel_source(&path).unwrap(), "__kernel void k() {}\n");
        std::fs::remove_file(&path).unwrap();
    }
}
