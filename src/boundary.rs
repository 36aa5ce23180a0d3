//! Imposed macroscopic strain and the Dirichlet data derived from it.
//!
//! A macroscopic strain test imposes an affine displacement field on the
//! domain boundary: nodes on selected faces have selected displacement
//! components prescribed to the linear interpolant of the strain tensor.
//! This module translates the strain descriptor into the fixed-DOF mask and
//! the initial (affine) displacement field the solver consumes.

use crate::grid::{NodeField, NodeMask, VoxelGrid};
use nalgebra::Matrix3;

/// Imposed macroscopic strain descriptor.
///
/// `boundary_restrictions[face][dir]` selects which displacement directions
/// are prescribed on which boundary-face pair: `face` indexes the x, y, z
/// face pairs of the domain box, `dir` the displacement component. A node on
/// face pair `f` has direction `d` fixed iff `boundary_restrictions[f][d]`.
#[derive(Debug, Clone, Copy)]
pub struct MacroscopicStrain {
    /// The imposed strain tensor (engineering components on the diagonal).
    pub tensor: Matrix3<f64>,
    /// Which direction is Dirichlet-fixed on which face pair.
    pub boundary_restrictions: [[bool; 3]; 3],
}

impl MacroscopicStrain {
    /// A strain descriptor with no restrictions and the given tensor.
    pub fn new(tensor: Matrix3<f64>) -> Self {
        Self {
            tensor,
            boundary_restrictions: [[false; 3]; 3],
        }
    }

    /// Uniaxial strain along `axis`: the corresponding face pair fixes the
    /// same displacement component; all other DOFs are free.
    pub fn uniaxial(axis: usize, strain: f64) -> Self {
        assert!(axis < 3);
        let mut tensor = Matrix3::zeros();
        tensor[(axis, axis)] = strain;
        let mut restrictions = [[false; 3]; 3];
        restrictions[axis][axis] = true;
        Self {
            tensor,
            boundary_restrictions: restrictions,
        }
    }

    /// Fix direction `dir` on face pair `face` as well.
    pub fn with_restriction(mut self, face: usize, dir: usize) -> Self {
        self.boundary_restrictions[face][dir] = true;
        self
    }

    /// The affine displacement component `d` at node (x, y, z):
    /// u_d = sum_e resolution[e] * x_e * strain[d][e].
    pub fn displacement_at(&self, x: i64, y: i64, z: i64, d: usize, resolution: &[f64; 3]) -> f64 {
        let coords = [x as f64, y as f64, z as f64];
        (0..3)
            .map(|e| resolution[e] * coords[e] * self.tensor[(d, e)])
            .sum()
    }
}

/// Build the Dirichlet mask for the imposed strain: every active node on a
/// restricted face gets the restricted directions fixed.
pub fn build_fixed_mask(grid: &VoxelGrid, strain: &MacroscopicStrain) -> NodeMask {
    let (n1, n2, n3) = grid.dims();
    let mut mask = NodeMask::for_grid(grid);
    for i3 in 0..=n3 {
        for i2 in 0..=n2 {
            for i1 in 0..=n1 {
                if !grid.is_vertex(i1 as i64, i2 as i64, i3 as i64) {
                    continue;
                }
                let on_face = [i1 == 0 || i1 == n1, i2 == 0 || i2 == n2, i3 == 0 || i3 == n3];
                for d in 0..3 {
                    let fixed = (0..3).any(|f| on_face[f] && strain.boundary_restrictions[f][d]);
                    if fixed {
                        mask.set(1, d, i1, i2, i3);
                    }
                }
            }
        }
    }
    mask
}

/// Build the affine initial displacement field for the imposed strain,
/// defined on every active node (fixed DOFs carry the imposed boundary
/// values, free DOFs the interpolated initial guess).
pub fn build_initial_displacements(
    grid: &VoxelGrid,
    resolution: &[f64; 3],
    strain: &MacroscopicStrain,
) -> NodeField {
    let (n1, n2, n3) = grid.dims();
    let mut field = NodeField::for_grid(grid);
    for i3 in 0..=n3 {
        for i2 in 0..=n2 {
            for i1 in 0..=n1 {
                if !grid.is_vertex(i1 as i64, i2 as i64, i3 as i64) {
                    continue;
                }
                for d in 0..3 {
                    let u = strain.displacement_at(i1 as i64, i2 as i64, i3 as i64, d, resolution);
                    field.set(u as f32, d, i1, i2, i3);
                }
            }
        }
    }
    field
}
