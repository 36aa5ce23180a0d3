//! Test fixtures: a physically valid elemental stiffness matrix.
//!
//! The solver consumes the 24x24 stiffness as an external constant, but the
//! scenario tests need one with real elastic structure so closed-form
//! checks (uniaxial stress, energy totals, reaction balance) mean
//! something. This builds the standard trilinear hexahedron stiffness by
//! 2x2x2 Gauss integration of B^T D B for an isotropic material, with the
//! DOF ordering the matvec packing expects: corner-lexicographic, x
//! fastest (see [`StiffnessMatrix`](crate::stiffness::StiffnessMatrix)).

use nalgebra::DMatrix;

/// Isotropic hex8 stiffness for a box element with edge lengths `h`,
/// Young's modulus `e` and Poisson's ratio `nu`, in corner-lexicographic
/// DOF order.
pub fn hex8_stiffness(e: f64, nu: f64, h: [f64; 3]) -> DMatrix<f64> {
    let lambda = e * nu / ((1.0 + nu) * (1.0 - 2.0 * nu));
    let mu = e / (2.0 * (1.0 + nu));

    // Constitutive matrix in Voigt order (11, 22, 33, 12, 13, 23) with
    // engineering shear strains.
    let mut d = [[0.0f64; 6]; 6];
    for i in 0..3 {
        for j in 0..3 {
            d[i][j] = if i == j { lambda + 2.0 * mu } else { lambda };
        }
        d[3 + i][3 + i] = mu;
    }

    // The element is an axis-aligned box, so the Jacobian is diagonal:
    // dN/dx_i = dN/dxi_i * 2 / h_i and det J = h1 h2 h3 / 8.
    let det_j = h[0] * h[1] * h[2] / 8.0;
    let g = 1.0 / 3.0f64.sqrt();

    let mut k = DMatrix::<f64>::zeros(24, 24);
    for gp in 0..8 {
        let xi = [
            if gp & 1 == 0 { -g } else { g },
            if gp & 2 == 0 { -g } else { g },
            if gp & 4 == 0 { -g } else { g },
        ];

        // Shape gradients per corner, corners lexicographic with x fastest.
        let mut grad = [[0.0f64; 3]; 8];
        for (corner, row) in grad.iter_mut().enumerate() {
            let sign = [
                if corner & 1 == 0 { -1.0 } else { 1.0 },
                if corner & 2 == 0 { -1.0 } else { 1.0 },
                if corner & 4 == 0 { -1.0 } else { 1.0 },
            ];
            for i in 0..3 {
                let mut value = 0.125 * sign[i];
                for j in 0..3 {
                    if j != i {
                        value *= 1.0 + sign[j] * xi[j];
                    }
                }
                row[i] = value * 2.0 / h[i];
            }
        }

        // Strain-displacement matrix, rows in the same Voigt order as D.
        let mut b = [[0.0f64; 24]; 6];
        for (corner, row) in grad.iter().enumerate() {
            let col = 3 * corner;
            b[0][col] = row[0];
            b[1][col + 1] = row[1];
            b[2][col + 2] = row[2];
            b[3][col] = row[1];
            b[3][col + 1] = row[0];
            b[4][col] = row[2];
            b[4][col + 2] = row[0];
            b[5][col + 1] = row[2];
            b[5][col + 2] = row[1];
        }

        // k += B^T D B * det J (unit Gauss weights).
        let mut db = [[0.0f64; 24]; 6];
        for i in 0..6 {
            for c in 0..24 {
                let mut acc = 0.0;
                for j in 0..6 {
                    acc += d[i][j] * b[j][c];
                }
                db[i][c] = acc;
            }
        }
        for r in 0..24 {
            for c in 0..24 {
                let mut acc = 0.0;
                for i in 0..6 {
                    acc += b[i][r] * db[i][c];
                }
                k[(r, c)] += acc * det_j;
            }
        }
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    #[test]
    fn test_stiffness_is_symmetric() {
        let k = hex8_stiffness(1000.0, 0.3, [1.0; 3]);
        for r in 0..24 {
            for c in 0..24 {
                assert_relative_eq!(k[(r, c)], k[(c, r)], epsilon = 1e-9 * 1000.0);
            }
        }
    }

    #[test]
    fn test_rigid_translations_are_in_the_null_space() {
        let k = hex8_stiffness(1000.0, 0.3, [1.0, 2.0, 0.5]);
        for d in 0..3 {
            let mut u = DVector::<f64>::zeros(24);
            for corner in 0..8 {
                u[3 * corner + d] = 1.0;
            }
            let f = &k * &u;
            for i in 0..24 {
                assert!(f[i].abs() < 1e-9, "translation {d} produces force {}", f[i]);
            }
        }
    }

    #[test]
    fn test_uniaxial_strain_energy() {
        // u1 = eps * x reproduces constant uniaxial strain exactly, so
        // u^T K u = (lambda + 2 mu) * eps^2 * V.
        let (e, nu, eps) = (1000.0, 0.3, 0.01);
        let h = [1.0; 3];
        let k = hex8_stiffness(e, nu, h);
        let mut u = DVector::<f64>::zeros(24);
        for corner in 0..8 {
            let dx = (corner & 1) as f64;
            u[3 * corner] = eps * dx * h[0];
        }
        let energy = u.dot(&(&k * &u));
        let lambda = e * nu / ((1.0 + nu) * (1.0 - 2.0 * nu));
        let mu = e / (2.0 * (1.0 + nu));
        let expected = (lambda + 2.0 * mu) * eps * eps * h[0] * h[1] * h[2];
        assert_relative_eq!(energy, expected, max_relative = 1e-9);
    }
}
