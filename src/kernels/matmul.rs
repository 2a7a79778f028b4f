//! The BLIS-style blocked GEMM, the one kernel the Scheduler and the
//! packed-buffer pools exist to serve.
//!
//! Blocking parameters: `mc=64` (m-axis), `kc=128` (k-axis), `nc=512`
//! (p-axis) outer blocks, a `4x4` (`mr x nr`) scalar-register
//! micro-kernel, and an unrolled ikj small-size fast path below `32`
//! in every dimension. `f32` and `f64` get mirrored,
//! independently-instantiated implementations (separate packed pools,
//! separate accumulator types) generated by one macro rather than
//! written twice by hand — the same codegen idiom the elementwise ops
//! module uses for its binary operators.

use crate::array::{Array, Buffer};
use crate::error::{GrowError, GrowResult};
use crate::kernels::pool::{PACKED_A_F32, PACKED_A_F64, PACKED_B_F32, PACKED_B_F64};
use crate::scheduler::parallel_for;

pub const MC: usize = 64;
pub const KC: usize = 128;
pub const NC: usize = 512;
pub const MR: usize = 4;
pub const NR: usize = 4;
const SMALL_THRESHOLD: usize = 32;

struct Dims {
    m: usize,
    n: usize,
    p: usize,
}

/// Rounds `n` up to the next multiple of `unit`. Used to size packed
/// panel buffers: `pack_a`/`pack_b` write `ceil(dim/unit)` full strips,
/// zero-padding the last one, so the buffer must hold that many
/// strips even when `dim` isn't itself a multiple of `unit`.
fn round_up(n: usize, unit: usize) -> usize {
    (n + unit - 1) / unit * unit
}

fn check_shapes(a: &Array, b: &Array, context: &str) -> GrowResult<Dims> {
    if a.shape().len() != 2 || b.shape().len() != 2 {
        return Err(GrowError::shape(
            context,
            &[a.shape().len(), b.shape().len()],
            &[2, 2],
        ));
    }
    a.require_same_dtype(b, context)?;
    let (m, n) = (a.shape()[0], a.shape()[1]);
    let (n2, p) = (b.shape()[0], b.shape()[1]);
    if n != n2 {
        return Err(GrowError::dimension(format!(
            "{context}: inner dimensions disagree ({n} vs {n2})"
        )));
    }
    Ok(Dims { m, n, p })
}

macro_rules! gemm_impl {
    ($ty:ty, $pack_a:ident, $pack_b:ident, $micro:ident, $blocked:ident, $small:ident, $dispatch:ident, $pool_a:expr, $pool_b:expr) => {
        /// Packs the `mc_cur x kc_cur` panel of `a` (row-major, leading
        /// dimension `lda`) starting at `(i0, k0)` into `mr`-height
        /// column-major strips, zero-padding the last strip's tail rows.
        fn $pack_a(
            a: &[$ty],
            lda: usize,
            i0: usize,
            mc_cur: usize,
            k0: usize,
            kc_cur: usize,
            out: &mut [$ty],
        ) {
            let panels = (mc_cur + MR - 1) / MR;
            for panel in 0..panels {
                let row0 = panel * MR;
                let rows_here = MR.min(mc_cur - row0);
                let base = panel * MR * kc_cur;
                for kk in 0..kc_cur {
                    for r in 0..MR {
                        out[base + kk * MR + r] = if r < rows_here {
                            a[(i0 + row0 + r) * lda + (k0 + kk)]
                        } else {
                            0.0 as $ty
                        };
                    }
                }
            }
        }

        /// Packs the `kc_cur x nc_cur` panel of `b` starting at
        /// `(k0, j0)` into `nr`-width row-major strips, zero-padding the
        /// last strip's tail columns.
        fn $pack_b(
            b: &[$ty],
            ldb: usize,
            k0: usize,
            kc_cur: usize,
            j0: usize,
            nc_cur: usize,
            out: &mut [$ty],
        ) {
            let panels = (nc_cur + NR - 1) / NR;
            for panel in 0..panels {
                let col0 = panel * NR;
                let cols_here = NR.min(nc_cur - col0);
                let base = panel * NR * kc_cur;
                for kk in 0..kc_cur {
                    for c in 0..NR {
                        out[base + kk * NR + c] = if c < cols_here {
                            b[(k0 + kk) * ldb + (j0 + col0 + c)]
                        } else {
                            0.0 as $ty
                        };
                    }
                }
            }
        }

        /// The 4x4 (`mr x nr`) accumulator tile: 16 scalar FMAs per `k`
        /// step, then a direct add into `c` at `(i_base, j_base)`.
        fn $micro(
            packed_a: &[$ty],
            packed_b: &[$ty],
            kc_cur: usize,
            c: &mut [$ty],
            ldc: usize,
            i_base: usize,
            j_base: usize,
            mr_cur: usize,
            nr_cur: usize,
        ) {
            let mut acc = [[0.0 as $ty; NR]; MR];
            for kk in 0..kc_cur {
                let a_k = &packed_a[kk * MR..kk * MR + MR];
                let b_k = &packed_b[kk * NR..kk * NR + NR];
                for i in 0..MR {
                    for j in 0..NR {
                        acc[i][j] += a_k[i] * b_k[j];
                    }
                }
            }
            for i in 0..mr_cur {
                for j in 0..nr_cur {
                    c[(i_base + i) * ldc + (j_base + j)] += acc[i][j];
                }
            }
        }

        /// Full BLIS-style blocked GEMM: `jc` (p) then `pc` (k) outer
        /// blocking; `parallel_for` splits `m` across workers at `mc`
        /// granularity, each worker packing its own A panel against a
        /// shared packed-B panel.
        fn $blocked(a: &[$ty], b: &[$ty], m: usize, k: usize, p: usize) -> Vec<$ty> {
            let mut c = vec![0.0 as $ty; m * p];
            let c_ptr = c.as_mut_ptr() as usize;

            let mut jc = 0;
            while jc < p {
                let nc_cur = NC.min(p - jc);
                let mut pc = 0;
                while pc < k {
                    let kc_cur = KC.min(k - pc);

                    let mut packed_b = $pool_b.acquire(round_up(nc_cur, NR) * kc_cur);
                    $pack_b(b, p, pc, kc_cur, jc, nc_cur, &mut packed_b);
                    let packed_b_ref = &packed_b;

                    parallel_for(m, MC, |chunk_start, chunk_end| {
                        // SAFETY: each (jc, pc) iteration's worker range
                        // [chunk_start, chunk_end) over m is disjoint
                        // from every other concurrent worker's range;
                        // all workers write only within their own rows
                        // of `c`, across the same fixed `jc` column
                        // block, so no two workers ever touch the same
                        // element.
                        let c_slice =
                            unsafe { std::slice::from_raw_parts_mut(c_ptr as *mut $ty, m * p) };
                        let mut ic = chunk_start;
                        while ic < chunk_end {
                            let mc_cur = MC.min(chunk_end - ic);
                            let mut packed_a = $pool_a.acquire(round_up(mc_cur, MR) * kc_cur);
                            $pack_a(a, k, ic, mc_cur, pc, kc_cur, &mut packed_a);

                            let m_panels = (mc_cur + MR - 1) / MR;
                            let n_panels = (nc_cur + NR - 1) / NR;
                            for mp in 0..m_panels {
                                let i_base = ic + mp * MR;
                                let mr_cur = MR.min(mc_cur - mp * MR);
                                let a_panel = &packed_a[mp * MR * kc_cur..(mp + 1) * MR * kc_cur];
                                for np in 0..n_panels {
                                    let j_base = jc + np * NR;
                                    let nr_cur = NR.min(nc_cur - np * NR);
                                    let b_panel =
                                        &packed_b_ref[np * NR * kc_cur..(np + 1) * NR * kc_cur];
                                    $micro(
                                        a_panel, b_panel, kc_cur, c_slice, p, i_base, j_base,
                                        mr_cur, nr_cur,
                                    );
                                }
                            }

                            $pool_a.release(packed_a);
                            ic += mc_cur;
                        }
                    });

                    $pool_b.release(packed_b);
                    pc += kc_cur;
                }
                jc += nc_cur;
            }
            c
        }

        /// Plain ikj triple loop with 4-way unrolling along `j`, used
        /// when packing overhead would dominate (`max(m,n,p) < 32`).
        fn $small(a: &[$ty], b: &[$ty], m: usize, k: usize, p: usize) -> Vec<$ty> {
            let mut c = vec![0.0 as $ty; m * p];
            for i in 0..m {
                for kk in 0..k {
                    let a_ik = a[i * k + kk];
                    if a_ik == 0.0 as $ty {
                        continue;
                    }
                    let b_row = &b[kk * p..kk * p + p];
                    let c_row = &mut c[i * p..i * p + p];
                    let chunks = p / 4;
                    for ch in 0..chunks {
                        let base = ch * 4;
                        c_row[base] += a_ik * b_row[base];
                        c_row[base + 1] += a_ik * b_row[base + 1];
                        c_row[base + 2] += a_ik * b_row[base + 2];
                        c_row[base + 3] += a_ik * b_row[base + 3];
                    }
                    for j in chunks * 4..p {
                        c_row[j] += a_ik * b_row[j];
                    }
                }
            }
            c
        }

        fn $dispatch(a: &[$ty], b: &[$ty], m: usize, k: usize, p: usize) -> Vec<$ty> {
            if m.max(k).max(p) < SMALL_THRESHOLD {
                $small(a, b, m, k, p)
            } else {
                $blocked(a, b, m, k, p)
            }
        }
    };
}

gemm_impl!(
    f32,
    pack_a_f32,
    pack_b_f32,
    micro_kernel_f32,
    gemm_blocked_f32,
    gemm_small_f32,
    dispatch_f32,
    PACKED_A_F32,
    PACKED_B_F32
);

gemm_impl!(
    f64,
    pack_a_f64,
    pack_b_f64,
    micro_kernel_f64,
    gemm_blocked_f64,
    gemm_small_f64,
    dispatch_f64,
    PACKED_A_F64,
    PACKED_B_F64
);

/// `C = A . B` for 2-D `A[m,n]`, `B[n,p]`. Fails if either input is
/// not 2-D, the inner dimensions disagree, or the dtypes differ.
pub fn matmul(a: &Array, b: &Array) -> GrowResult<Array> {
    let dims = check_shapes(a, b, "matmul")?;
    match (a.buffer(), b.buffer()) {
        (Buffer::F32(x), Buffer::F32(y)) => Array::from_f32(
            dispatch_f32(x, y, dims.m, dims.n, dims.p),
            vec![dims.m, dims.p],
        ),
        (Buffer::F64(x), Buffer::F64(y)) => Array::from_f64(
            dispatch_f64(x, y, dims.m, dims.n, dims.p),
            vec![dims.m, dims.p],
        ),
        _ => unreachable!("dtype checked in check_shapes"),
    }
}

/// `C = A . Bᵀ` given `A[m,n]` and `b_t[p,n]`, computed directly as a
/// dot product between row `i` of `A` and row `j` of `b_t`, without
/// materializing a transpose. Must agree with `matmul(A, transpose(b_t))`
/// bit-for-bit within rounding.
pub fn matmul_transpose_b(a: &Array, b_t: &Array) -> GrowResult<Array> {
    if a.shape().len() != 2 || b_t.shape().len() != 2 {
        return Err(GrowError::shape(
            "matmul_transpose_b",
            &[a.shape().len(), b_t.shape().len()],
            &[2, 2],
        ));
    }
    a.require_same_dtype(b_t, "matmul_transpose_b")?;
    let (m, n) = (a.shape()[0], a.shape()[1]);
    let (p, n2) = (b_t.shape()[0], b_t.shape()[1]);
    if n != n2 {
        return Err(GrowError::dimension(format!(
            "matmul_transpose_b: inner dimensions disagree ({n} vs {n2})"
        )));
    }
    match (a.buffer(), b_t.buffer()) {
        (Buffer::F32(x), Buffer::F32(y)) => {
            Array::from_f32(matmul_transpose_b_f32(x, y, m, n, p), vec![m, p])
        }
        (Buffer::F64(x), Buffer::F64(y)) => {
            Array::from_f64(matmul_transpose_b_f64(x, y, m, n, p), vec![m, p])
        }
        _ => unreachable!("dtype checked above"),
    }
}

/// `C = Aᵀ . B` given `a_t[k,m]` and `B[k,p]`, computed by iterating
/// `k` in the outer loop and scattering `a_t[k,i] . B[k,j]` into `C`.
/// Must agree with `matmul(transpose(a_t), B)` bit-for-bit within
/// rounding.
pub fn matmul_transpose_a(a_t: &Array, b: &Array) -> GrowResult<Array> {
    if a_t.shape().len() != 2 || b.shape().len() != 2 {
        return Err(GrowError::shape(
            "matmul_transpose_a",
            &[a_t.shape().len(), b.shape().len()],
            &[2, 2],
        ));
    }
    a_t.require_same_dtype(b, "matmul_transpose_a")?;
    let (k, m) = (a_t.shape()[0], a_t.shape()[1]);
    let (k2, p) = (b.shape()[0], b.shape()[1]);
    if k != k2 {
        return Err(GrowError::dimension(format!(
            "matmul_transpose_a: inner dimensions disagree ({k} vs {k2})"
        )));
    }
    match (a_t.buffer(), b.buffer()) {
        (Buffer::F32(x), Buffer::F32(y)) => {
            Array::from_f32(matmul_transpose_a_f32(x, y, k, m, p), vec![m, p])
        }
        (Buffer::F64(x), Buffer::F64(y)) => {
            Array::from_f64(matmul_transpose_a_f64(x, y, k, m, p), vec![m, p])
        }
        _ => unreachable!("dtype checked above"),
    }
}

macro_rules! transpose_variant_impls {
    ($ty:ty, $tb:ident, $ta:ident) => {
        fn $tb(a: &[$ty], b_t: &[$ty], m: usize, n: usize, p: usize) -> Vec<$ty> {
            let mut c = vec![0.0 as $ty; m * p];
            for i in 0..m {
                let a_row = &a[i * n..i * n + n];
                for j in 0..p {
                    let b_row = &b_t[j * n..j * n + n];
                    let mut acc = 0.0 as $ty;
                    for kk in 0..n {
                        acc += a_row[kk] * b_row[kk];
                    }
                    c[i * p + j] = acc;
                }
            }
            c
        }

        fn $ta(a_t: &[$ty], b: &[$ty], k: usize, m: usize, p: usize) -> Vec<$ty> {
            let mut c = vec![0.0 as $ty; m * p];
            for kk in 0..k {
                let a_row = &a_t[kk * m..kk * m + m];
                let b_row = &b[kk * p..kk * p + p];
                for i in 0..m {
                    let a_ki = a_row[i];
                    if a_ki == 0.0 as $ty {
                        continue;
                    }
                    let c_row = &mut c[i * p..i * p + p];
                    for j in 0..p {
                        c_row[j] += a_ki * b_row[j];
                    }
                }
            }
            c
        }
    };
}

transpose_variant_impls!(f32, matmul_transpose_b_f32, matmul_transpose_a_f32);
transpose_variant_impls!(f64, matmul_transpose_b_f64, matmul_transpose_a_f64);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::ops::transpose;
    use crate::dtype::{set_default_dtype, DType};

    #[test]
    fn matmul_2x3_3x2_matches_hand_computed_result() {
        set_default_dtype(DType::F64);
        let a = Array::from_f64(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
        let b = Array::from_f64(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], vec![3, 2]).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[2, 2]);
        assert_eq!(c.to_vec_f64(), vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn rejects_mismatched_inner_dims() {
        let a = Array::from_f64(vec![1.0, 2.0], vec![1, 2]).unwrap();
        let b = Array::from_f64(vec![1.0, 2.0, 3.0], vec![3, 1]).unwrap();
        assert!(matmul(&a, &b).is_err());
    }

    #[test]
    fn rejects_non_2d_input() {
        let a = Array::from_f64(vec![1.0, 2.0, 3.0], vec![3]).unwrap();
        let b = Array::from_f64(vec![1.0, 2.0, 3.0], vec![3, 1]).unwrap();
        assert!(matmul(&a, &b).is_err());
    }

    #[test]
    fn small_path_matches_manual_result() {
        let a = Array::from_f64(vec![1.0, 0.0, 0.0, 1.0], vec![2, 2]).unwrap();
        let b = Array::from_f64(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]).unwrap();
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.to_vec_f64(), vec![5.0, 6.0, 7.0, 8.0]);
    }

    fn random_matrix(m: usize, n: usize, seed: u64) -> Array {
        set_default_dtype(DType::F64);
        Array::randn(&[m, n], seed).unwrap()
    }

    #[test]
    fn variant_agreement_128x128() {
        let a = random_matrix(128, 128, 1);
        let b = random_matrix(128, 128, 2);
        let direct = matmul(&a, &b).unwrap();

        let b_t = transpose(&b).unwrap();
        let via_b = matmul_transpose_b(&a, &b_t).unwrap();

        let a_t = transpose(&a).unwrap();
        let via_a = matmul_transpose_a(&a_t, &b).unwrap();

        let d = direct.to_vec_f64();
        let vb = via_b.to_vec_f64();
        let va = via_a.to_vec_f64();
        for i in 0..d.len() {
            let rel = |x: f64, y: f64| (x - y).abs() / x.abs().max(y.abs()).max(1e-12);
            assert!(rel(d[i], vb[i]) < 1e-9, "transpose_b mismatch at {i}");
            assert!(rel(d[i], va[i]) < 1e-9, "transpose_a mismatch at {i}");
        }
    }

    #[test]
    fn blocked_path_matches_small_path_on_boundary_sizes() {
        // 40x40 exceeds the small-path threshold (32) but is still
        // smaller than a single mc/kc/nc block, exercising the ragged
        // tail of the packing/micro-kernel logic.
        let a = random_matrix(40, 40, 11);
        let b = random_matrix(40, 40, 12);
        let blocked = matmul(&a, &b).unwrap().to_vec_f64();
        let small = gemm_small_f64(
            a.as_f64().unwrap(),
            b.as_f64().unwrap(),
            40,
            40,
            40,
        );
        for (x, y) in blocked.iter().zip(small.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn blocked_path_with_non_multiple_of_four_block_dims() {
        // max(m,n,p) = 32 takes the blocked path (the small-path cutoff
        // is strict `<`), and neither nc_cur=1 nor kc_cur=1 is a
        // multiple of MR/NR — exercises the packed-panel sizing at its
        // raggedest.
        set_default_dtype(DType::F64);
        let a = random_matrix(32, 1, 21);
        let b = random_matrix(1, 1, 22);
        let c = matmul(&a, &b).unwrap();
        assert_eq!(c.shape(), &[32, 1]);
        let a_vals = a.to_vec_f64();
        let b0 = b.to_vec_f64()[0];
        let expected: Vec<f64> = a_vals.iter().map(|&x| x * b0).collect();
        for (x, y) in c.to_vec_f64().iter().zip(expected.iter()) {
            assert!((x - y).abs() < 1e-9);
        }
    }
}
