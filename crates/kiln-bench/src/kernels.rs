//! The matmul kernel source and its host implementations.
//!
//! Both variants take `(M, N, K, A, B, C)`: three `int` sizes followed by
//! column-major `A (M x K)`, `B (K x N)` and the output `C (M x N)`.

use rayon::prelude::*;

use kiln_core::{HostArgs, KernelLibrary, NdRange};

/// OpenCL C source of `matmul_v1` and `matmul_v2`.
pub const MATMUL_SOURCE: &str = include_str!("../kernels/matmul.cl");

/// Edge of the square work-group tile used by `matmul_v2`.
pub const TILE: usize = 2;

/// One work-item per output element.
pub const MATMUL_V1: &str = "matmul_v1";

/// Work-group tiled through local memory.
pub const MATMUL_V2: &str = "matmul_v2";

/// Host implementations of every kernel in [`MATMUL_SOURCE`].
pub fn host_library() -> KernelLibrary {
    KernelLibrary::new()
        .with(MATMUL_V1, matmul_v1)
        .with(MATMUL_V2, matmul_v2)
}

struct Operands<'a> {
    m: usize,
    n: usize,
    k: usize,
    a: &'a [f32],
    b: &'a [f32],
    c: &'a mut [f32],
}

fn operands<'a>(range: &NdRange, args: &mut HostArgs<'a>) -> Result<Operands<'a>, String> {
    let dim = |index: usize, value: i32| {
        usize::try_from(value).map_err(|_| format!("argument {} must be non-negative, got {}", index, value))
    };
    let m = dim(0, args.scalar::<i32>(0)?)?;
    let n = dim(1, args.scalar::<i32>(1)?)?;
    let k = dim(2, args.scalar::<i32>(2)?)?;
    let a: &[f32] = args.buffer(3)?;
    let b: &[f32] = args.buffer(4)?;
    let c: &mut [f32] = args.buffer(5)?;

    if range.global() != [m, n] {
        return Err(format!("expected a global range of [{}, {}], got {:?}", m, n, range.global()));
    }
    if a.len() < m * k || b.len() < k * n || c.len() < m * n {
        return Err(format!(
            "buffers too small for {}x{}x{}: A {}, B {}, C {}",
            m,
            n,
            k,
            a.len(),
            b.len(),
            c.len()
        ));
    }
    Ok(Operands { m, n, k, a, b, c: &mut c[..m * n] })
}

fn matmul_v1(range: &NdRange, args: &mut HostArgs<'_>) -> Result<(), String> {
    let Operands { m, n: _, k, a, b, c } = operands(range, args)?;
    if m == 0 {
        return Ok(());
    }
    c.par_chunks_mut(m).enumerate().for_each(|(col, out)| {
        for (row, value) in out.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for i in 0..k {
                acc += a[i * m + row] * b[col * k + i];
            }
            *value = acc;
        }
    });
    Ok(())
}

fn matmul_v2(range: &NdRange, args: &mut HostArgs<'_>) -> Result<(), String> {
    if range.local() != Some(&[TILE, TILE][..]) {
        return Err(format!("matmul_v2 needs a local size of [{}, {}], got {:?}", TILE, TILE, range.local()));
    }
    let Operands { m, n, k, a, b, c } = operands(range, args)?;
    if m % TILE != 0 || n % TILE != 0 || k % TILE != 0 {
        return Err(format!("matmul_v2 needs sizes divisible by {}, got {}x{}x{}", TILE, m, n, k));
    }
    if m == 0 || n == 0 {
        return Ok(());
    }

    // One parallel task per column of work-groups; each group stages TILE x
    // TILE blocks of A and B the way the device kernel does.
    c.par_chunks_mut(m * TILE).enumerate().for_each(|(group_col, block)| {
        let mut a_tile = [0.0f32; TILE * TILE];
        let mut b_tile = [0.0f32; TILE * TILE];
        for group_row in 0..m / TILE {
            let mut acc = [0.0f32; TILE * TILE];
            for t in 0..k / TILE {
                for col in 0..TILE {
                    for row in 0..TILE {
                        let gm = TILE * group_row + row;
                        let gn = TILE * group_col + col;
                        a_tile[col * TILE + row] = a[(TILE * t + col) * m + gm];
                        b_tile[col * TILE + row] = b[gn * k + TILE * t + row];
                    }
                }
                for col in 0..TILE {
                    for row in 0..TILE {
                        for i in 0..TILE {
                            acc[col * TILE + row] += a_tile[i * TILE + row] * b_tile[col * TILE + i];
                        }
                    }
                }
            }
            for col in 0..TILE {
                for row in 0..TILE {
                    block[col * m + TILE * group_row + row] = acc[col * TILE + row];
                }
            }
        }
    });
    Ok(())
}
