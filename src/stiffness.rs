//! Elemental stiffness matrix storage.
//!
//! The solver consumes one dense 24x24 stiffness matrix shared by all
//! elements; each element scales it by its volume fraction (and, in a
//! nonlinear run, by the softening factor). The matrix is stored contiguous
//! row-major so the matvec inner loop walks it linearly.
//!
//! # DOF ordering
//!
//! Row/column index `3 * (dx + 2*dy + 4*dz) + dof` addresses displacement
//! component `dof` of the element corner at offset (dx, dy, dz), i.e. the
//! eight corners in lexicographic order with x fastest:
//!
//! ```text
//! corner 0: (0,0,0)   corner 4: (0,0,1)
//! corner 1: (1,0,0)   corner 5: (1,0,1)
//! corner 2: (0,1,0)   corner 6: (0,1,1)
//! corner 3: (1,1,0)   corner 7: (1,1,1)
//! ```
//!
//! This matches the gather/scatter packing used by the element kernel, which
//! relies on x-adjacent nodes holding consecutive variable indices.

use crate::error::{Error, Result};
use nalgebra::DMatrix;

/// Number of DOFs of one hexahedral element (8 corners x 3 components).
pub const ELEMENT_DOFS: usize = 24;

/// Dense, symmetric 24x24 elemental stiffness matrix.
#[derive(Debug, Clone)]
pub struct StiffnessMatrix {
    data: [f32; ELEMENT_DOFS * ELEMENT_DOFS],
}

impl StiffnessMatrix {
    /// Build from a dense matrix, validating shape and symmetry.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the matrix is not 24x24, contains non-finite
    /// entries, or is asymmetric beyond a small relative tolerance.
    pub fn from_matrix(matrix: &DMatrix<f64>) -> Result<Self> {
        if matrix.nrows() != ELEMENT_DOFS || matrix.ncols() != ELEMENT_DOFS {
            return Err(Error::InvalidInput(format!(
                "stiffness matrix must be 24x24, got {}x{}",
                matrix.nrows(),
                matrix.ncols()
            )));
        }
        if matrix.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidInput("stiffness matrix has non-finite entries".into()));
        }
        let scale = matrix.amax();
        for r in 0..ELEMENT_DOFS {
            for c in (r + 1)..ELEMENT_DOFS {
                let diff = (matrix[(r, c)] - matrix[(c, r)]).abs();
                if diff > 1e-6 * scale.max(1.0) {
                    return Err(Error::InvalidInput(format!(
                        "stiffness matrix asymmetric at ({r},{c})"
                    )));
                }
            }
        }
        let mut data = [0.0f32; ELEMENT_DOFS * ELEMENT_DOFS];
        for r in 0..ELEMENT_DOFS {
            for c in 0..ELEMENT_DOFS {
                data[r * ELEMENT_DOFS + c] = matrix[(r, c)] as f32;
            }
        }
        Ok(Self { data })
    }

    /// Build from row-major rows without a symmetry check (test fixtures).
    pub fn from_rows(rows: &[[f64; ELEMENT_DOFS]; ELEMENT_DOFS]) -> Self {
        let mut data = [0.0f32; ELEMENT_DOFS * ELEMENT_DOFS];
        for (r, row) in rows.iter().enumerate() {
            for (c, &v) in row.iter().enumerate() {
                data[r * ELEMENT_DOFS + c] = v as f32;
            }
        }
        Self { data }
    }

    /// Entry at (row, col).
    #[inline]
    pub fn value(&self, row: usize, col: usize) -> f32 {
        self.data[row * ELEMENT_DOFS + col]
    }

    /// Diagonal entry `K[k,k]`.
    #[inline]
    pub fn diagonal(&self, k: usize) -> f32 {
        self.data[k * ELEMENT_DOFS + k]
    }

    /// Contiguous row-major entries, length 576.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Local DOF index of displacement component `dof` at the corner with
    /// offset (dx, dy, dz).
    #[inline]
    pub fn dof_index(dx: usize, dy: usize, dz: usize, dof: usize) -> usize {
        3 * (dx + 2 * dy + 4 * dz) + dof
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_wrong_shape() {
        let m = DMatrix::<f64>::identity(23, 23);
        assert!(matches!(
            StiffnessMatrix::from_matrix(&m),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejects_asymmetry() {
        let mut m = DMatrix::<f64>::identity(24, 24);
        m[(0, 1)] = 1.0;
        assert!(StiffnessMatrix::from_matrix(&m).is_err());
    }

    #[test]
    fn test_rejects_non_finite() {
        let mut m = DMatrix::<f64>::identity(24, 24);
        m[(3, 3)] = f64::NAN;
        assert!(StiffnessMatrix::from_matrix(&m).is_err());
    }

    #[test]
    fn test_roundtrip_and_diagonal() {
        let mut m = DMatrix::<f64>::zeros(24, 24);
        for i in 0..24 {
            m[(i, i)] = (i + 1) as f64;
        }
        m[(0, 5)] = 2.5;
        m[(5, 0)] = 2.5;
        let k = StiffnessMatrix::from_matrix(&m).unwrap();
        assert_eq!(k.value(0, 5), 2.5);
        assert_eq!(k.diagonal(7), 8.0);
        assert_eq!(k.as_slice().len(), 576);
    }

    #[test]
    fn test_dof_index_ordering() {
        assert_eq!(StiffnessMatrix::dof_index(0, 0, 0, 0), 0);
        assert_eq!(StiffnessMatrix::dof_index(1, 0, 0, 0), 3);
        assert_eq!(StiffnessMatrix::dof_index(0, 1, 0, 0), 6);
        assert_eq!(StiffnessMatrix::dof_index(1, 1, 0, 2), 11);
        assert_eq!(StiffnessMatrix::dof_index(0, 0, 1, 0), 12);
        assert_eq!(StiffnessMatrix::dof_index(1, 1, 1, 2), 23);
    }
}
