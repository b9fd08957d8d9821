//! Integer least squares by the LAMBDA method: LD factorization,
//! lattice reduction (integer Gauss transforms + symmetric pair
//! permutations), then a depth-first search for the closest integer
//! vectors.

use nalgebra::{DMatrix, DVector};

use crate::error::Error;

const LOOP_MAX: usize = 10_000;

fn round(x: f64) -> f64 {
    (x + 0.5).floor()
}

fn sgn(x: f64) -> f64 {
    if x <= 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Q = L' diag(d) L with L unit lower triangular.
fn ld_factorization(q: &DMatrix<f64>) -> Option<(DMatrix<f64>, DVector<f64>)> {
    let n = q.nrows();
    let mut a = q.clone();
    let mut l = DMatrix::<f64>::zeros(n, n);
    let mut d = DVector::<f64>::zeros(n);

    for i in (0..n).rev() {
        d[i] = a[(i, i)];
        if d[i] <= 0.0 {
            return None;
        }
        let sq = d[i].sqrt();
        for j in 0..=i {
            l[(i, j)] = a[(i, j)] / sq;
        }
        for j in 0..i {
            for k in 0..=j {
                a[(j, k)] -= l[(i, k)] * l[(i, j)];
            }
        }
        for j in 0..=i {
            l[(i, j)] /= l[(i, i)];
        }
    }
    Some((l, d))
}

/// Integer Gauss transform on column j, pivot row i.
fn gauss(l: &mut DMatrix<f64>, z: &mut DMatrix<f64>, i: usize, j: usize) {
    let n = l.nrows();
    let mu = round(l[(i, j)]);
    if mu != 0.0 {
        for k in i..n {
            l[(k, j)] -= mu * l[(k, i)];
        }
        for k in 0..n {
            z[(k, j)] -= mu * z[(k, i)];
        }
    }
}

/// Permutation of the (j, j+1) pair when it improves the conditioning.
fn permute(l: &mut DMatrix<f64>, d: &mut DVector<f64>, j: usize, del: f64, z: &mut DMatrix<f64>) {
    let n = l.nrows();
    let eta = d[j] / del;
    let lam = d[j + 1] * l[(j + 1, j)] / del;

    d[j] = eta * d[j + 1];
    d[j + 1] = del;

    for k in 0..j {
        let a0 = l[(j, k)];
        let a1 = l[(j + 1, k)];
        l[(j, k)] = -l[(j + 1, j)] * a0 + a1;
        l[(j + 1, k)] = eta * a0 + lam * a1;
    }
    l[(j + 1, j)] = lam;

    for k in (j + 2)..n {
        l.swap((k, j), (k, j + 1));
    }
    for k in 0..n {
        z.swap((k, j), (k, j + 1));
    }
}

/// Lattice reduction. Iterates until no permutation improves the
/// diagonal ordering.
fn reduction(l: &mut DMatrix<f64>, d: &mut DVector<f64>, z: &mut DMatrix<f64>) {
    let n = l.nrows();
    if n < 2 {
        return;
    }
    let mut j = n - 2;
    let mut k = n - 2;
    loop {
        if j <= k {
            for i in (j + 1)..n {
                gauss(l, z, i, j);
            }
        }
        let del = d[j] + l[(j + 1, j)].powi(2) * d[j + 1];
        if del + 1.0E-6 < d[j + 1] {
            permute(l, d, j, del, z);
            k = j;
            j = n - 2;
        } else if j == 0 {
            break;
        } else {
            j -= 1;
        }
    }
}

/// Depth-first search around the conditional rounding, keeping the
/// `m` best integer candidates.
fn search(
    l: &DMatrix<f64>,
    d: &DVector<f64>,
    zs: &DVector<f64>,
    m: usize,
) -> (Vec<DVector<f64>>, Vec<f64>) {
    let n = l.nrows();
    let mut candidates = vec![DVector::<f64>::zeros(n); m];
    let mut s = vec![0.0_f64; m];

    let mut big_s = DMatrix::<f64>::zeros(n, n);
    let mut dist = vec![0.0_f64; n];
    let mut zb = vec![0.0_f64; n];
    let mut z = vec![0.0_f64; n];
    let mut step = vec![0.0_f64; n];

    let mut k = n - 1;
    let mut nn = 0usize;
    let mut imax = 0usize;
    let mut maxdist = 1.0E99;

    zb[k] = zs[k];
    z[k] = round(zb[k]);
    let mut y = zb[k] - z[k];
    step[k] = sgn(y);

    for _ in 0..LOOP_MAX {
        let newdist = dist[k] + y * y / d[k];
        if newdist < maxdist {
            if k != 0 {
                k -= 1;
                dist[k] = newdist;
                for i in 0..=k {
                    big_s[(k, i)] = big_s[(k + 1, i)] + (z[k + 1] - zb[k + 1]) * l[(k + 1, i)];
                }
                zb[k] = zs[k] + big_s[(k, k)];
                z[k] = round(zb[k]);
                y = zb[k] - z[k];
                step[k] = sgn(y);
            } else {
                if nn < m {
                    if nn == 0 || newdist > s[imax] {
                        imax = nn;
                    }
                    for i in 0..n {
                        candidates[nn][i] = z[i];
                    }
                    s[nn] = newdist;
                    nn += 1;
                } else {
                    if newdist < s[imax] {
                        for i in 0..n {
                            candidates[imax][i] = z[i];
                        }
                        s[imax] = newdist;
                        imax = 0;
                        for i in 0..m {
                            if s[imax] < s[i] {
                                imax = i;
                            }
                        }
                    }
                    maxdist = s[imax];
                }
                z[0] += step[0];
                y = zb[0] - z[0];
                step[0] = -step[0] - sgn(step[0]);
            }
        } else if k == n - 1 {
            break;
        } else {
            k += 1;
            z[k] += step[k];
            y = zb[k] - z[k];
            step[k] = -step[k] - sgn(step[k]);
        }
    }

    // ascending residual order
    for i in 0..m.saturating_sub(1) {
        for j in (i + 1)..m {
            if s[i] > s[j] {
                s.swap(i, j);
                candidates.swap(i, j);
            }
        }
    }
    (candidates, s)
}

/// Resolves the `m` best integer candidates for the float ambiguity
/// vector `a` with covariance `q`. Returns candidates (original space)
/// and their quadratic form residuals, ascending.
pub(crate) fn lambda_search(
    a: &DVector<f64>,
    q: &DMatrix<f64>,
    m: usize,
) -> Result<(Vec<DVector<f64>>, Vec<f64>), Error> {
    let n = a.len();
    if n == 0 || m == 0 || q.nrows() != n {
        return Err(Error::MatrixInversion);
    }

    let (mut l, mut d) = ld_factorization(q).ok_or(Error::CovarianceNotPositiveDefinite)?;
    let mut z = DMatrix::<f64>::identity(n, n);

    reduction(&mut l, &mut d, &mut z);

    let zs = z.transpose() * a;
    let (reduced, s) = search(&l, &d, &zs, m);

    // back to the original space: Z' N = z_cand
    let z_t_inv = z
        .transpose()
        .try_inverse()
        .ok_or(Error::MatrixInversion)?;

    let candidates = reduced
        .iter()
        .map(|cand| {
            let mut back = z_t_inv.clone() * cand;
            for v in back.iter_mut() {
                *v = round(*v);
            }
            back
        })
        .collect();

    Ok((candidates, s))
}

/// Ratio test metric: second best over best quadratic residual,
/// clamped for reporting.
pub(crate) fn ratio(s: &[f64]) -> f64 {
    if s.len() < 2 || s[0] <= 0.0 {
        return 0.0;
    }
    (s[1] / s[0]).min(crate::constants::Constants::MAX_RATIO)
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn example_q() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            3,
            3,
            &[
                0.0400, -0.0120, 0.0080, -0.0120, 0.0250, -0.0050, 0.0080, -0.0050, 0.0360,
            ],
        )
    }

    #[test]
    fn ld_reconstructs_q() {
        let q = example_q();
        let (l, d) = ld_factorization(&q).unwrap();
        let rebuilt = l.transpose() * DMatrix::from_diagonal(&d) * &l;
        for i in 0..3 {
            for j in 0..3 {
                assert!((rebuilt[(i, j)] - q[(i, j)]).abs() < 1.0E-12);
            }
        }
    }

    #[test]
    fn reduction_shrinks_off_diagonals() {
        let q = example_q();
        let (mut l, mut d) = ld_factorization(&q).unwrap();
        let mut z = DMatrix::<f64>::identity(3, 3);
        reduction(&mut l, &mut d, &mut z);
        for i in 0..3 {
            for j in 0..i {
                assert!(l[(i, j)].abs() <= 0.5 + 1.0E-9);
            }
        }
        // transform stayed unimodular
        let det = z.determinant();
        assert!((det.abs() - 1.0).abs() < 1.0E-9);
    }

    #[test]
    fn residuals_match_the_quadratic_form() {
        let q = example_q();
        let a = DVector::from_vec(vec![4.8, -2.1, 7.05]);
        let (candidates, s) = lambda_search(&a, &q, 2).unwrap();

        let q_inv = q.try_inverse().unwrap();
        for (cand, s_k) in candidates.iter().zip(s.iter()) {
            let d = &a - cand;
            let direct = (d.transpose() * &q_inv * &d)[(0, 0)];
            assert!((direct - s_k).abs() < 1.0E-6, "{} vs {}", direct, s_k);
        }
        assert!(s[0] <= s[1]);
    }

    #[test]
    fn near_integer_input_resolves_by_rounding() {
        let q = example_q();
        let a = DVector::from_vec(vec![5.02, -2.99, 11.01]);
        let (candidates, s) = lambda_search(&a, &q, 2).unwrap();
        assert_eq!(candidates[0][0], 5.0);
        assert_eq!(candidates[0][1], -3.0);
        assert_eq!(candidates[0][2], 11.0);
        assert!(ratio(&s) > 3.0);
    }

    /// Statistical round trip: floats drawn around an integer truth
    /// with the search covariance must resolve back to the truth
    /// virtually every time the ratio validates.
    #[test]
    fn statistical_round_trip() {
        let q = example_q() * 0.5;
        let truth = DVector::from_vec(vec![3.0, -7.0, 12.0]);

        // sample correlated noise through the Cholesky factor
        let chol = nalgebra::Cholesky::new(q.clone()).unwrap();
        let lower = chol.l();
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut rng = SmallRng::seed_from_u64(0xC0FFEE);

        let trials = 1000;
        let mut validated = 0;
        let mut correct = 0;

        for _ in 0..trials {
            let white = DVector::from_iterator(3, (0..3).map(|_| normal.sample(&mut rng)));
            let a = &truth + &lower * white;
            let (candidates, s) = lambda_search(&a, &q, 2).unwrap();
            if ratio(&s) >= 3.0 {
                validated += 1;
                if candidates[0] == truth {
                    correct += 1;
                }
            }
        }

        assert!(validated > trials / 2, "ratio validated {} only", validated);
        let rate = correct as f64 / validated as f64;
        assert!(rate > 0.99, "success rate {}", rate);
    }
}
