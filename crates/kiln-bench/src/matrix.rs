//! Host-side dense matrix.

use std::ops::{Index, IndexMut};

/// `rows x cols` single-precision matrix, column-major: element `(r, c)`
/// is stored at `r + c * rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Zero-filled matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols, data: vec![0.0; rows * cols] }
    }

    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut m = Self::new(rows, cols);
        for c in 0..cols {
            for r in 0..rows {
                m.data[r + c * rows] = f(r, c);
            }
        }
        m
    }

    pub fn identity(n: usize) -> Self {
        Self::from_fn(n, n, |r, c| if r == c { 1.0 } else { 0.0 })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, r: usize, c: usize) -> Option<f32> {
        if r < self.rows && c < self.cols {
            Some(self.data[r + c * self.rows])
        } else {
            None
        }
    }

    /// Column-major storage.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    fn offset(&self, r: usize, c: usize) -> usize {
        assert!(
            r < self.rows && c < self.cols,
            "index ({}, {}) out of bounds for {}x{} matrix",
            r,
            c,
            self.rows,
            self.cols
        );
        r + c * self.rows
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f32;

    fn index(&self, (r, c): (usize, usize)) -> &f32 {
        &self.data[self.offset(r, c)]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut f32 {
        let i = self.offset(r, c);
        &mut self.data[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_major_layout() {
        let mut m = Matrix::new(2, 3);
        m[(1, 0)] = 1.0;
        m[(0, 2)] = 5.0;
        assert_eq!(m.as_slice(), &[0.0, 1.0, 0.0, 0.0, 5.0, 0.0]);
        assert_eq!(m.get(0, 2), Some(5.0));
        assert_eq!(m.get(2, 0), None);
    }

    #[test]
    fn test_from_fn_and_identity() {
        let m = Matrix::from_fn(2, 2, |r, c| (r * 10 + c) as f32);
        assert_eq!(m.as_slice(), &[0.0, 10.0, 1.0, 11.0]);
        let i = Matrix::identity(3);
        assert_eq!(i[(1, 1)], 1.0);
        assert_eq!(i[(1, 2)], 0.0);
        assert_eq!(i.len(), 9);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_index_out_of_bounds() {
        let m = Matrix::new(2, 2);
        let _ = m[(2, 0)];
    }
}
