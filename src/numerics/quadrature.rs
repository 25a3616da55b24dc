//! Gauss-Legendre quadrature, computed by Newton iteration on the Legendre
//! polynomial rather than a shipped table (spec.md §4.3's "initialized
//! lazily" common-numerics lifecycle), and the orthonormal shifted-Legendre
//! polynomial evaluation used as the scaling-function basis.

/// Evaluate `P_n(x)` and its derivative via the standard three-term
/// recurrence, `x` in `[-1, 1]`.
fn legendre(n: usize, x: f64) -> (f64, f64) {
    if n == 0 {
        return (1.0, 0.0);
    }
    let (mut p_prev, mut p_cur) = (1.0, x);
    for k in 1..n {
        let k = k as f64;
        let p_next = ((2.0 * k + 1.0) * x * p_cur - k * p_prev) / (k + 1.0);
        p_prev = p_cur;
        p_cur = p_next;
    }
    let n_f = n as f64;
    let denom = 1.0 - x * x;
    let deriv = if denom.abs() < 1e-14 {
        // Endpoints x = +-1: P_n'(1) = n(n+1)/2, P_n'(-1) = (-1)^(n-1) n(n+1)/2.
        let base = n_f * (n_f + 1.0) / 2.0;
        if x > 0.0 { base } else { base * (-1.0f64).powi(n as i32 - 1) }
    } else {
        n_f * (p_prev - x * p_cur) / denom
    };
    (p_cur, deriv)
}

/// `n`-point Gauss-Legendre nodes and weights on `[0, 1]`.
///
/// Integrates polynomials of degree `<= 2n - 1` exactly. Roots are found by
/// Newton iteration from the classical Chebyshev-like initial guess, then
/// the `[-1, 1]` nodes/weights are affinely mapped to `[0, 1]`.
#[must_use]
pub fn gauss_legendre_unit(n: usize) -> (Vec<f64>, Vec<f64>) {
    assert!(n > 0, "quadrature order must be positive");
    let mut nodes = vec![0.0; n];
    let mut weights = vec![0.0; n];
    let nf = n as f64;
    for i in 0..n {
        // Initial guess (Francesco Tricomi's approximation to GL roots).
        let k = i + 1;
        let mut x = (std::f64::consts::PI * (k as f64 - 0.25) / (nf + 0.5)).cos();
        for _ in 0..100 {
            let (p, dp) = legendre(n, x);
            let dx = p / dp;
            x -= dx;
            if dx.abs() < 1e-15 {
                break;
            }
        }
        let (_, dp) = legendre(n, x);
        let w = 2.0 / ((1.0 - x * x) * dp * dp);
        nodes[i] = x;
        weights[i] = w;
    }
    // Sort ascending (Newton may not preserve monotone order across i).
    let mut pairs: Vec<(f64, f64)> = nodes.into_iter().zip(weights).collect();
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
    let nodes: Vec<f64> = pairs.iter().map(|(x, _)| 0.5 * (x + 1.0)).collect();
    let weights: Vec<f64> = pairs.iter().map(|(_, w)| 0.5 * w).collect();
    (nodes, weights)
}

/// `n`-point Gauss-Legendre nodes and weights mapped onto `[a, b]`.
#[must_use]
pub fn gauss_legendre_interval(n: usize, a: f64, b: f64) -> (Vec<f64>, Vec<f64>) {
    let (unit_nodes, unit_weights) = gauss_legendre_unit(n);
    let scale = b - a;
    let nodes = unit_nodes.iter().map(|x| a + scale * x).collect();
    let weights = unit_weights.iter().map(|w| scale * w).collect();
    (nodes, weights)
}

/// Value of the `j`-th orthonormal shifted Legendre polynomial at `x in
/// [0, 1]`: `phi_j(x) = sqrt(2j + 1) * P_j(2x - 1)`, the scaling-function
/// basis used throughout [`crate::numerics`].
#[must_use]
pub fn phi(j: usize, x: f64) -> f64 {
    let (p, _) = legendre(j, 2.0 * x - 1.0);
    ((2 * j + 1) as f64).sqrt() * p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_interval_length() {
        let (_, w) = gauss_legendre_unit(8);
        let sum: f64 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn integrates_polynomials_exactly() {
        let (x, w) = gauss_legendre_unit(5);
        // integral of x^8 over [0,1] is 1/9; 5-point rule is exact to degree 9.
        let approx: f64 = x.iter().zip(&w).map(|(xi, wi)| wi * xi.powi(8)).sum();
        assert!((approx - 1.0 / 9.0).abs() < 1e-12);
    }

    #[test]
    fn phi_basis_is_orthonormal() {
        let (x, w) = gauss_legendre_unit(10);
        for j in 0..5 {
            for l in 0..5 {
                let ip: f64 = x.iter().zip(&w).map(|(xi, wi)| wi * phi(j, *xi) * phi(l, *xi)).sum();
                let expect = if j == l { 1.0 } else { 0.0 };
                assert!((ip - expect).abs() < 1e-9, "j={j} l={l} ip={ip}");
            }
        }
    }
}
