use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Relative pivot size below which a system is treated as singular.
const SINGULAR_EPS: f64 = 1e-12;

pub struct MatrixHelper;

impl MatrixHelper {
    /// Least-squares solution of `design · β ≈ observations` via the normal equations.
    pub fn least_squares(
        design: ArrayView2<f64>,
        observations: ArrayView1<f64>,
    ) -> Option<Array1<f64>> {
        if design.nrows() != observations.len() || design.nrows() < design.ncols() {
            return None;
        }
        let gram = design.t().dot(&design);
        let rhs = design.t().dot(&observations);
        Self::solve(gram, rhs)
    }

    /// Gaussian elimination with partial pivoting. Returns `None` for singular systems.
    pub fn solve(mut a: Array2<f64>, mut b: Array1<f64>) -> Option<Array1<f64>> {
        let n = a.nrows();
        if n == 0 || a.ncols() != n || b.len() != n {
            return None;
        }
        let scale = a.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(1.0);

        for col in 0..n {
            let pivot = (col..n).max_by(|&i, &j| a[[i, col]].abs().total_cmp(&a[[j, col]].abs()))?;
            if a[[pivot, col]].abs() <= scale * SINGULAR_EPS {
                return None;
            }
            if pivot != col {
                for k in 0..n {
                    a.swap([col, k], [pivot, k]);
                }
                b.swap(col, pivot);
            }
            for row in col + 1..n {
                let factor = a[[row, col]] / a[[col, col]];
                for k in col..n {
                    a[[row, k]] -= factor * a[[col, k]];
                }
                b[row] -= factor * b[col];
            }
        }

        let mut x = Array1::zeros(n);
        for row in (0..n).rev() {
            let mut acc = b[row];
            for k in row + 1..n {
                acc -= a[[row, k]] * x[k];
            }
            x[row] = acc / a[[row, row]];
        }
        Some(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn solves_small_system() {
        let a = array![[2.0, 1.0], [1.0, 3.0]];
        let b = array![3.0, 5.0];
        let x = MatrixHelper::solve(a, b).unwrap();
        assert!((x[0] - 0.8).abs() < 1e-12);
        assert!((x[1] - 1.4).abs() < 1e-12);
    }

    #[test]
    fn singular_system_returns_none() {
        let a = array![[1.0, 2.0], [2.0, 4.0]];
        assert!(MatrixHelper::solve(a, array![1.0, 2.0]).is_none());
    }

    #[test]
    fn least_squares_recovers_plane() {
        // z = 2 + 0.5x - y
        let points = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (2.0, 3.0), (4.0, 1.0)];
        let mut design = Array2::zeros((points.len(), 3));
        let mut obs = Array1::zeros(points.len());
        for (i, &(x, y)) in points.iter().enumerate() {
            design[[i, 0]] = 1.0;
            design[[i, 1]] = x;
            design[[i, 2]] = y;
            obs[i] = 2.0 + 0.5 * x - y;
        }
        let beta = MatrixHelper::least_squares(design.view(), obs.view()).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-9);
        assert!((beta[1] - 0.5).abs() < 1e-9);
        assert!((beta[2] + 1.0).abs() < 1e-9);
    }
}
