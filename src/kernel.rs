//! Element-level stiffness application.
//!
//! The operator A is never assembled: every matvec walks the element list,
//! gathers the 24 local values, applies the shared 24x24 stiffness scaled by
//! the element's volume fraction (and softening factor, if any), and
//! scatter-adds into owned destinations only.
//!
//! # Index packing
//!
//! An element stores four base indices `refs[k]`, the first DOF index of the
//! corner node at (dy, dz) offset (k & 1, k >> 1). Variable indices are
//! assigned x-fastest over the block, so `refs[k] + 3` is the first DOF of
//! the +x neighbour corner; slot `k*6 + j` of the 24-vector is therefore
//! DOF `j % 3` of corner (j / 3, k & 1, k >> 1) — the corner-lexicographic
//! order the stiffness matrix is laid out in.

use crate::adjuster::StiffnessAdjuster;
use crate::stiffness::{StiffnessMatrix, ELEMENT_DOFS};

/// Vertex owned by this block, strictly inside the slab.
pub const VERTEX_INTERNAL: u8 = 1;
/// Vertex owned by this block, on the slab boundary layer (exported).
pub const VERTEX_INNER_INTERFACE: u8 = 2;
/// Padding-ring vertex owned by a neighbour block (imported, never reduced).
pub const VERTEX_OUTER_INTERFACE: u8 = 3;

/// One occupied voxel inside a block.
#[derive(Debug, Clone)]
pub struct Element {
    /// First DOF index of the four (dy, dz) corner nodes.
    pub refs: [usize; 4],
    /// Volume-fraction percent (1..=100).
    pub bvf: u8,
    /// Accumulated strain, updated during nonlinear continuation.
    pub strain: f32,
}

/// The 24 variable indices of an element, in stiffness-matrix slot order.
#[inline]
pub fn element_dof_indices(refs: &[usize; 4]) -> [usize; ELEMENT_DOFS] {
    let mut indices = [0usize; ELEMENT_DOFS];
    for k in 0..4 {
        for j in 0..6 {
            indices[k * 6 + j] = refs[k] + j;
        }
    }
    indices
}

/// Combined elemental scale: volume fraction times softening factor.
#[inline]
pub fn scale_factor(bvf: u8, strain: f32, adjuster: Option<&dyn StiffnessAdjuster>) -> f32 {
    let mut factor = f32::from(bvf) / 100.0;
    if let Some(adjuster) = adjuster {
        factor *= adjuster.factor(strain);
    }
    factor
}

/// Apply the scaled stiffness to one element's 24-vector.
#[inline]
pub fn apply_element(
    stiffness: &StiffnessMatrix,
    x: &[f32; ELEMENT_DOFS],
    factor: f32,
) -> [f32; ELEMENT_DOFS] {
    let data = stiffness.as_slice();
    let mut y = [0.0f32; ELEMENT_DOFS];
    let mut ct = 0;
    for row in y.iter_mut() {
        let mut acc = 0.0f32;
        for &xc in x.iter() {
            acc += data[ct] * xc;
            ct += 1;
        }
        *row = acc * factor;
    }
    y
}

/// Matrix-free matvec y = A x over the element list.
///
/// Destination entries whose vertex is outer-interface are skipped: those
/// DOFs are owned by a neighbour block and must not accumulate here.
pub fn multiply(
    stiffness: &StiffnessMatrix,
    elements: &[Element],
    adjuster: Option<&dyn StiffnessAdjuster>,
    vertex_type: &[u8],
    x: &[f32],
    y: &mut [f32],
) {
    y.fill(0.0);
    for element in elements {
        let indices = element_dof_indices(&element.refs);
        let mut x0 = [0.0f32; ELEMENT_DOFS];
        for (slot, &vi) in indices.iter().enumerate() {
            x0[slot] = x[vi];
        }
        let factor = scale_factor(element.bvf, element.strain, adjuster);
        let y0 = apply_element(stiffness, &x0, factor);
        for (slot, &vi) in indices.iter().enumerate() {
            if vertex_type[vi] != VERTEX_OUTER_INTERFACE {
                y[vi] += y0[slot];
            }
        }
    }
}

/// Accumulate the Jacobi diagonal over owned free DOFs.
pub fn accumulate_diagonal(
    stiffness: &StiffnessMatrix,
    elements: &[Element],
    adjuster: Option<&dyn StiffnessAdjuster>,
    vertex_type: &[u8],
    free: &[u8],
    diagonal: &mut [f32],
) {
    for element in elements {
        let indices = element_dof_indices(&element.refs);
        let factor = scale_factor(element.bvf, element.strain, adjuster);
        for (slot, &vi) in indices.iter().enumerate() {
            if vertex_type[vi] != VERTEX_OUTER_INTERFACE && free[vi] != 0 {
                diagonal[vi] += stiffness.diagonal(slot) * factor;
            }
        }
    }
}

/// The quadratic form x^T K x over one element's 24 DOFs (unscaled).
pub fn element_quadratic_form(stiffness: &StiffnessMatrix, x: &[f32], refs: &[usize; 4]) -> f64 {
    let indices = element_dof_indices(refs);
    let mut x0 = [0.0f32; ELEMENT_DOFS];
    for (slot, &vi) in indices.iter().enumerate() {
        x0[slot] = x[vi];
    }
    let data = stiffness.as_slice();
    let mut energy = 0.0f64;
    let mut ct = 0;
    for &xr in x0.iter() {
        for &xc in x0.iter() {
            energy += f64::from(data[ct]) * f64::from(xc) * f64::from(xr);
            ct += 1;
        }
    }
    energy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjuster::LinearSoftening;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn identity_stiffness() -> StiffnessMatrix {
        StiffnessMatrix::from_matrix(&DMatrix::identity(24, 24)).unwrap()
    }

    /// A lone element on 24 consecutive DOFs, all internal.
    fn single_element() -> (Vec<Element>, Vec<u8>, Vec<u8>) {
        let elements = vec![Element {
            refs: [0, 6, 12, 18],
            bvf: 100,
            strain: 0.0,
        }];
        let vertex_type = vec![VERTEX_INTERNAL; 24];
        let free = vec![1u8; 24];
        (elements, vertex_type, free)
    }

    #[test]
    fn test_dof_indices_are_consecutive_per_ref() {
        let indices = element_dof_indices(&[0, 6, 12, 18]);
        let expected: Vec<usize> = (0..24).collect();
        assert_eq!(indices.to_vec(), expected);
        let indices = element_dof_indices(&[30, 0, 60, 90]);
        assert_eq!(&indices[0..6], &[30, 31, 32, 33, 34, 35]);
        assert_eq!(&indices[6..9], &[0, 1, 2]);
    }

    #[test]
    fn test_identity_matvec_scales_by_bvf() {
        let k = identity_stiffness();
        let (mut elements, vertex_type, _) = single_element();
        elements[0].bvf = 50;
        let x: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let mut y = vec![0.0f32; 24];
        multiply(&k, &elements, None, &vertex_type, &x, &mut y);
        for i in 0..24 {
            assert_relative_eq!(y[i], 0.5 * i as f32, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_adjuster_scales_the_matvec() {
        let k = identity_stiffness();
        let (mut elements, vertex_type, _) = single_element();
        elements[0].strain = 10.0; // far beyond yield, factor floors at 0.05
        let law = LinearSoftening::new(0.01);
        let x = vec![1.0f32; 24];
        let mut y = vec![0.0f32; 24];
        multiply(&k, &elements, Some(&law), &vertex_type, &x, &mut y);
        for &v in &y {
            assert_relative_eq!(v, 0.05, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_scatter_skips_outer_interface() {
        let k = identity_stiffness();
        let (elements, mut vertex_type, _) = single_element();
        for vt in vertex_type[0..6].iter_mut() {
            *vt = VERTEX_OUTER_INTERFACE;
        }
        let x = vec![1.0f32; 24];
        let mut y = vec![0.0f32; 24];
        multiply(&k, &elements, None, &vertex_type, &x, &mut y);
        for &v in &y[0..6] {
            assert_eq!(v, 0.0);
        }
        for &v in &y[6..24] {
            assert_relative_eq!(v, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_matvec_symmetry() {
        // Symmetric K implies <p, Aq> = <q, Ap>.
        let mut m = DMatrix::<f64>::zeros(24, 24);
        let mut state = 0x12345678u64;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f64 / (1u64 << 31) as f64) - 0.5
        };
        for r in 0..24 {
            for c in 0..=r {
                let v = next();
                m[(r, c)] = v;
                m[(c, r)] = v;
            }
        }
        let k = StiffnessMatrix::from_matrix(&m).unwrap();
        let (elements, vertex_type, _) = single_element();
        let p: Vec<f32> = (0..24).map(|_| next() as f32).collect();
        let q: Vec<f32> = (0..24).map(|_| next() as f32).collect();
        let mut ap = vec![0.0f32; 24];
        let mut aq = vec![0.0f32; 24];
        multiply(&k, &elements, None, &vertex_type, &p, &mut ap);
        multiply(&k, &elements, None, &vertex_type, &q, &mut aq);
        let p_aq: f64 = p.iter().zip(&aq).map(|(&a, &b)| f64::from(a) * f64::from(b)).sum();
        let q_ap: f64 = q.iter().zip(&ap).map(|(&a, &b)| f64::from(a) * f64::from(b)).sum();
        assert_relative_eq!(p_aq, q_ap, epsilon = 1e-5, max_relative = 1e-4);
    }

    #[test]
    fn test_diagonal_accumulation_respects_free_mask() {
        let k = identity_stiffness();
        let (elements, vertex_type, mut free) = single_element();
        free[0] = 0;
        let mut diag = vec![0.0f32; 24];
        accumulate_diagonal(&k, &elements, None, &vertex_type, &free, &mut diag);
        assert_eq!(diag[0], 0.0);
        for &d in &diag[1..] {
            assert_relative_eq!(d, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_quadratic_form_identity() {
        let k = identity_stiffness();
        let x: Vec<f32> = (0..24).map(|i| (i % 3) as f32).collect();
        let expected: f64 = x.iter().map(|&v| f64::from(v) * f64::from(v)).sum();
        let energy = element_quadratic_form(&k, &x, &[0, 6, 12, 18]);
        assert_relative_eq!(energy, expected, epsilon = 1e-9);
    }
}
