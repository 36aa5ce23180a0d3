//! Per-slab block state and the two-phase iteration kernels.
//!
//! A block owns one contiguous z-range of node planes and the full x,y
//! extent, padded by one ring so local coordinates can address
//! neighbour-owned nodes. Variable indices are assigned x-fastest over the
//! padded box (three consecutive DOFs per active node), which is what lets
//! the element kernel address an x-adjacent node pair through one base
//! index.
//!
//! Vertex ownership: a DOF is owned here iff its vertex is internal or
//! inner-interface. Outer-interface DOFs mirror a neighbour's values: they
//! are written from the neighbour's exported slice before each matvec and
//! never contribute to reductions. The element list includes the padding
//! layer of elements below the slab so the matvec rows of boundary vertices
//! are complete; the scatter mask keeps the duplicated work from
//! double-counting owned DOFs.

use std::sync::Arc;

use crate::adjuster::StiffnessAdjuster;
use crate::grid::{ElementField, NodeField, NodeMask, VoxelGrid};
use crate::interface::InterfaceSlice;
use crate::kernel::{
    self, Element, VERTEX_INNER_INTERFACE, VERTEX_INTERNAL, VERTEX_OUTER_INTERFACE,
};
use crate::partition::SlabRange;
use crate::stiffness::StiffnessMatrix;

/// Inputs for building one block out of the global problem data.
pub struct BlockSetup<'a> {
    pub grid: &'a VoxelGrid,
    pub fixed: &'a NodeMask,
    pub initial_displacements: &'a NodeField,
    pub stiffness: Arc<StiffnessMatrix>,
    pub youngs_modulus: f64,
    pub voxel_volume: f64,
    pub resolution: [f64; 3],
    pub slab: SlabRange,
    pub use_preconditioner: bool,
}

/// Outputs of block setup consumed by the coordinator.
pub struct SetupOutput {
    /// Owned-free residual norm squared after r = -A x0.
    pub rnorm2: f64,
    /// Initial search direction on the low-z inner-interface plane.
    pub inner_lo: InterfaceSlice,
    /// Initial search direction on the high-z inner-interface plane.
    pub inner_hi: InterfaceSlice,
}

/// Partial inner products from step A, reduced by the coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct StepA {
    pub r_z: f64,
    pub r_ap: f64,
    pub p_ap: f64,
    pub ap_ap: f64,
}

/// Step-B outputs: updated interface planes, residual norms, partial stress.
#[derive(Debug, Clone)]
pub struct StepB {
    /// Owned-free residual norm squared after the update.
    pub r_r: f64,
    /// Owned-fixed residual norm squared (Dirichlet reaction forces).
    pub bb_bb: f64,
    /// Partial macroscopic stress moment, Voigt order.
    pub stress: [f64; 6],
    pub inner_lo: InterfaceSlice,
    pub inner_hi: InterfaceSlice,
}

struct VertexLocation {
    x: usize,
    y: usize,
    z: usize,
    ref_index: usize,
}

/// One z-slab of the decomposed domain.
pub struct Block {
    stiffness: Arc<StiffnessMatrix>,
    youngs_modulus: f64,
    voxel_volume: f64,
    resolution: [f64; 3],
    nx: usize,
    ny: usize,
    nz: usize,
    x_position: i64,
    y_position: i64,
    z_position: i64,
    num_variables: usize,
    x: Vec<f32>,
    r: Vec<f32>,
    p: Vec<f32>,
    ap: Vec<f32>,
    preconditioner: Vec<f32>,
    use_preconditioner: bool,
    free: Vec<u8>,
    vertex_type: Vec<u8>,
    elements: Vec<Element>,
    element_positions: Vec<(usize, usize, usize)>,
    inner_vertices: Vec<VertexLocation>,
    outer_vertices: Vec<VertexLocation>,
    variable_indices: Vec<i64>,
    adjuster: Option<Arc<dyn StiffnessAdjuster>>,
}

impl Block {
    /// Build the block for one slab; `None` when the padded slab holds no
    /// active node at all.
    pub fn setup(params: &BlockSetup) -> Option<(Self, SetupOutput)> {
        let (n1, n2, _) = params.grid.dims();
        let nx = n1 + 3;
        let ny = n2 + 3;
        let nz = params.slab.num_planes();
        let x_position = -1i64;
        let y_position = -1i64;
        let z_position = params.slab.zmin as i64;

        // Mark every node touched by an occupied voxel in the padded slab,
        // including the element layer just below the slab.
        let vdims = (nx + 2, ny + 2, nz + 2);
        let vindex = |xx: usize, yy: usize, zz: usize| (zz * vdims.1 + yy) * vdims.0 + xx;
        let mut occupancy = vec![0u8; vdims.0 * vdims.1 * vdims.2];
        for zz in 0..=nz {
            for yy in 0..=ny {
                for xx in 0..=nx {
                    let world = (
                        xx as i64 + x_position - 1,
                        yy as i64 + y_position - 1,
                        zz as i64 + z_position - 1,
                    );
                    if params.grid.is_element(world.0, world.1, world.2) {
                        for dz in 0..=1 {
                            for dy in 0..=1 {
                                for dx in 0..=1 {
                                    occupancy[vindex(xx + dx, yy + dy, zz + dz)] = 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        // Assign variable indices x-fastest: the element kernel depends on
        // x-adjacent nodes holding consecutive index triples.
        let mut variable_indices = vec![-1i64; vdims.0 * vdims.1 * vdims.2];
        let mut num_variables = 0usize;
        for zz in 0..vdims.2 {
            for yy in 0..vdims.1 {
                for xx in 0..vdims.0 {
                    if occupancy[vindex(xx, yy, zz)] != 0 {
                        variable_indices[vindex(xx, yy, zz)] = num_variables as i64;
                        num_variables += 3;
                    }
                }
            }
        }

        if num_variables == 0 {
            return None;
        }

        let mut block = Self {
            stiffness: Arc::clone(&params.stiffness),
            youngs_modulus: params.youngs_modulus,
            voxel_volume: params.voxel_volume,
            resolution: params.resolution,
            nx,
            ny,
            nz,
            x_position,
            y_position,
            z_position,
            num_variables,
            x: vec![0.0; num_variables],
            r: vec![0.0; num_variables],
            p: vec![0.0; num_variables],
            ap: vec![0.0; num_variables],
            preconditioner: Vec::new(),
            use_preconditioner: params.use_preconditioner,
            free: vec![0; num_variables],
            vertex_type: vec![0; num_variables],
            elements: Vec::new(),
            element_positions: Vec::new(),
            inner_vertices: Vec::new(),
            outer_vertices: Vec::new(),
            variable_indices,
            adjuster: None,
        };

        // Classify vertices, record interface locations, seed x from the
        // initial displacement field (fixed DOFs carry Dirichlet values).
        for zz in 0..vdims.2 {
            for yy in 0..vdims.1 {
                for xx in 0..vdims.0 {
                    let varind = block.variable_indices[vindex(xx, yy, zz)];
                    if varind < 0 {
                        continue;
                    }
                    let varind = varind as usize;
                    let world = (
                        xx as i64 + x_position - 1,
                        yy as i64 + y_position - 1,
                        zz as i64 + z_position - 1,
                    );
                    let internal = (2..=nx - 1).contains(&xx)
                        && (2..=ny - 1).contains(&yy)
                        && (2..=nz - 1).contains(&zz);
                    let inner = (1..=nx).contains(&xx)
                        && (1..=ny).contains(&yy)
                        && (1..=nz).contains(&zz);
                    let vtype = if internal {
                        VERTEX_INTERNAL
                    } else if inner {
                        VERTEX_INNER_INTERFACE
                    } else {
                        VERTEX_OUTER_INTERFACE
                    };
                    if vtype == VERTEX_INNER_INTERFACE {
                        block.inner_vertices.push(VertexLocation {
                            x: xx,
                            y: yy,
                            z: zz,
                            ref_index: varind,
                        });
                    } else if vtype == VERTEX_OUTER_INTERFACE {
                        block.outer_vertices.push(VertexLocation {
                            x: xx,
                            y: yy,
                            z: zz,
                            ref_index: varind,
                        });
                    }
                    for d in 0..3 {
                        block.vertex_type[varind + d] = vtype;
                        if params.fixed.value(d, world.0, world.1, world.2) == 0 {
                            block.free[varind + d] = 1;
                        }
                        block.x[varind + d] =
                            params
                                .initial_displacements
                                .value(d, world.0, world.1, world.2);
                    }
                }
            }
        }

        // Element list over the padded slab, z/y/x ascending.
        for zz in 0..=nz {
            for yy in 0..=ny {
                for xx in 0..=nx {
                    let world = (
                        xx as i64 + x_position - 1,
                        yy as i64 + y_position - 1,
                        zz as i64 + z_position - 1,
                    );
                    let bvf = params.grid.value(world.0, world.1, world.2);
                    if bvf == 0 {
                        continue;
                    }
                    let refs = [
                        block.variable_indices[vindex(xx, yy, zz)],
                        block.variable_indices[vindex(xx, yy + 1, zz)],
                        block.variable_indices[vindex(xx, yy, zz + 1)],
                        block.variable_indices[vindex(xx, yy + 1, zz + 1)],
                    ];
                    debug_assert!(refs.iter().all(|&r| r >= 0));
                    block.elements.push(Element {
                        refs: [
                            refs[0] as usize,
                            refs[1] as usize,
                            refs[2] as usize,
                            refs[3] as usize,
                        ],
                        bvf,
                        strain: 0.0,
                    });
                    block.element_positions.push((xx, yy, zz));
                }
            }
        }

        // r = -A x: the Dirichlet values inside x act as the implicit load,
        // so no separate right-hand side is needed.
        block.compute_residual();
        let rnorm2 = block.dot_owned_free(&block.r, &block.r);

        if block.use_preconditioner {
            block.preconditioner = vec![0.0; num_variables];
            kernel::accumulate_diagonal(
                &block.stiffness,
                &block.elements,
                block.adjuster.as_deref(),
                &block.vertex_type,
                &block.free,
                &mut block.preconditioner,
            );
        }

        // p = z = M^-1 r on free DOFs, zero elsewhere (r is zero on the
        // outer ring, so p starts consistent there too).
        for i in 0..num_variables {
            if block.free[i] != 0 {
                block.p[i] = block.precondition(i, block.r[i]);
            }
        }

        let (inner_lo, inner_hi) = block.package_inner_interfaces();
        Some((
            block,
            SetupOutput {
                rnorm2,
                inner_lo,
                inner_hi,
            },
        ))
    }

    /// Install (or clear) the nonlinear stiffness adjuster.
    pub fn set_adjuster(&mut self, adjuster: Option<Arc<dyn StiffnessAdjuster>>) {
        self.adjuster = adjuster;
    }

    /// First phase: import neighbour search-direction planes, apply the
    /// operator, and return the partial inner products.
    pub fn iterate_step_a(
        &mut self,
        outer_lo: Option<&InterfaceSlice>,
        outer_hi: Option<&InterfaceSlice>,
    ) -> StepA {
        // Under an adjuster A changes between iterations, so the residual
        // recurrence is invalid and r must be rebuilt from x.
        if self.adjuster.is_some() {
            self.compute_residual();
        }

        for vertex in &self.outer_vertices {
            let slice = if vertex.z == 0 {
                outer_lo
            } else if vertex.z == self.nz + 1 {
                outer_hi
            } else {
                None
            };
            let Some(slice) = slice else { continue };
            for d in 0..3 {
                let varind = vertex.ref_index + d;
                if self.free[varind] != 0 {
                    self.p[varind] = slice.value(d, vertex.x - 1, vertex.y - 1);
                }
            }
        }

        // p is now defined everywhere, including the padding ring.
        kernel::multiply(
            &self.stiffness,
            &self.elements,
            self.adjuster.as_deref(),
            &self.vertex_type,
            &self.p,
            &mut self.ap,
        );

        if self.use_preconditioner {
            StepA {
                r_z: self.dot_owned_free_scaled(&self.r, &self.r),
                r_ap: self.dot_owned_free_scaled(&self.r, &self.ap),
                ap_ap: self.dot_owned_free_scaled(&self.ap, &self.ap),
                p_ap: self.dot_owned_free(&self.p, &self.ap),
            }
        } else {
            StepA {
                r_z: self.dot_owned_free(&self.r, &self.r),
                r_ap: self.dot_owned_free(&self.r, &self.ap),
                ap_ap: self.dot_owned_free(&self.ap, &self.ap),
                p_ap: self.dot_owned_free(&self.p, &self.ap),
            }
        }
    }

    /// Second phase: advance the CG recurrences, evaluate the partial
    /// stress, and export the refreshed inner-interface planes.
    pub fn iterate_step_b(&mut self, alpha: f64, beta: f64) -> StepB {
        let alpha32 = alpha as f32;
        let beta32 = beta as f32;
        for i in 0..self.num_variables {
            // r stays valid on owned DOFs only; on fixed DOFs it
            // accumulates the Dirichlet reaction force.
            self.r[i] -= self.ap[i] * alpha32;
            if self.free[i] != 0 {
                self.x[i] += self.p[i] * alpha32;
                self.p[i] = self.p[i] * beta32 + self.precondition(i, self.r[i]);
            }
        }

        let r_r = self.dot_owned_free(&self.r, &self.r);
        let bb_bb = self.dot_owned_fixed(&self.r, &self.r);
        let stress = self.compute_stress();
        let (inner_lo, inner_hi) = self.package_inner_interfaces();

        if self.adjuster.is_some() {
            self.update_element_strains();
        }

        StepB {
            r_r,
            bb_bb,
            stress,
            inner_lo,
            inner_hi,
        }
    }

    /// Partial macroscopic stress moment over this block's owned nodes.
    ///
    /// At convergence the residual vanishes on free DOFs and equals -(A x)
    /// on fixed ones, so the constraint reaction is -r; its moment against
    /// the node's world position accumulates the volume integral of the
    /// stress (tension positive). The caller divides by the total domain
    /// volume. The sweep covers local planes 1..=Nz, exactly the owned
    /// range, so no node is counted by two blocks.
    pub fn compute_stress(&self) -> [f64; 6] {
        let mut stress = [0.0f64; 6];
        for i3 in 0..self.nz {
            for i2 in 0..self.ny {
                for i1 in 0..self.nx {
                    let varind = self.variable_index(i1 + 1, i2 + 1, i3 + 1);
                    if varind < 0 {
                        continue;
                    }
                    let varind = varind as usize;
                    let fx = -f64::from(self.r[varind]);
                    let fy = -f64::from(self.r[varind + 1]);
                    let fz = -f64::from(self.r[varind + 2]);
                    if fx == 0.0 && fy == 0.0 && fz == 0.0 {
                        continue;
                    }
                    let px = (self.x_position + i1 as i64) as f64 * self.resolution[0];
                    let py = (self.y_position + i2 as i64) as f64 * self.resolution[1];
                    let pz = (self.z_position + i3 as i64) as f64 * self.resolution[2];
                    stress[0] += fx * px;
                    stress[1] += fy * py;
                    stress[2] += fz * pz;
                    stress[3] += 0.5 * (fx * py + fy * px);
                    stress[4] += 0.5 * (fx * pz + fz * px);
                    stress[5] += 0.5 * (fy * pz + fz * py);
                }
            }
        }
        stress
    }

    /// Write this block's per-element strain energies into the global map.
    ///
    /// Padding-layer elements are recomputed identically by the neighbour
    /// block, so overlapping writes agree.
    pub fn collect_energy(&self, out: &mut ElementField) {
        let (n1, n2, n3) = out.dims();
        for (element, &(xx, yy, zz)) in self.elements.iter().zip(&self.element_positions) {
            let world = (
                xx as i64 + self.x_position - 1,
                yy as i64 + self.y_position - 1,
                zz as i64 + self.z_position - 1,
            );
            if world.0 < 0 || world.1 < 0 || world.2 < 0 {
                continue;
            }
            let (wx, wy, wz) = (world.0 as usize, world.1 as usize, world.2 as usize);
            if wx >= n1 || wy >= n2 || wz >= n3 {
                continue;
            }
            out.set(self.element_energy(element) as f32, wx, wy, wz);
        }
    }

    /// Write this block's owned displacements into the global field.
    pub fn collect_displacements(&self, out: &mut NodeField) {
        self.collect_nodal(&self.x, out);
    }

    /// Write this block's owned residuals (reaction forces) into the
    /// global field.
    pub fn collect_forces(&self, out: &mut NodeField) {
        self.collect_nodal(&self.r, out);
    }

    /// Displacement component at a local node; zero if inactive.
    pub fn displacement(&self, xx: usize, yy: usize, zz: usize, d: usize) -> f32 {
        let varind = self.variable_index(xx, yy, zz);
        if varind < 0 {
            0.0
        } else {
            self.x[varind as usize + d]
        }
    }

    /// Residual component at a local node; zero if inactive.
    pub fn force(&self, xx: usize, yy: usize, zz: usize, d: usize) -> f32 {
        let varind = self.variable_index(xx, yy, zz);
        if varind < 0 {
            0.0
        } else {
            self.r[varind as usize + d]
        }
    }

    /// Number of owned free DOFs.
    pub fn owned_free_variable_count(&self) -> usize {
        (0..self.num_variables)
            .filter(|&i| self.free[i] != 0 && self.vertex_type[i] != VERTEX_OUTER_INTERFACE)
            .count()
    }

    /// Number of owned DOFs (free and fixed).
    pub fn owned_variable_count(&self) -> usize {
        (0..self.num_variables)
            .filter(|&i| self.vertex_type[i] != VERTEX_OUTER_INTERFACE)
            .count()
    }

    /// Total DOFs including the padding ring.
    pub fn variable_count(&self) -> usize {
        self.num_variables
    }

    /// World z index of the first owned node plane.
    pub fn z_position(&self) -> i64 {
        self.z_position
    }

    /// Local node-plane extents (Nx, Ny, Nz).
    pub fn local_dims(&self) -> (usize, usize, usize) {
        (self.nx, self.ny, self.nz)
    }

    fn collect_nodal(&self, values: &[f32], out: &mut NodeField) {
        for kk in 0..self.nz {
            for jj in 0..self.ny {
                for ii in 0..self.nx {
                    let varind = self.variable_index(ii + 1, jj + 1, kk + 1);
                    if varind < 0 {
                        continue;
                    }
                    let world = (
                        self.x_position + ii as i64,
                        self.y_position + jj as i64,
                        self.z_position + kk as i64,
                    );
                    for d in 0..3 {
                        out.set(
                            values[varind as usize + d],
                            d,
                            world.0 as usize,
                            world.1 as usize,
                            world.2 as usize,
                        );
                    }
                }
            }
        }
    }

    fn variable_index(&self, xx: usize, yy: usize, zz: usize) -> i64 {
        self.variable_indices[(zz * (self.ny + 2) + yy) * (self.nx + 2) + xx]
    }

    fn compute_residual(&mut self) {
        kernel::multiply(
            &self.stiffness,
            &self.elements,
            self.adjuster.as_deref(),
            &self.vertex_type,
            &self.x,
            &mut self.r,
        );
        for value in self.r.iter_mut() {
            *value = -*value;
        }
    }

    #[inline]
    fn precondition(&self, i: usize, value: f32) -> f32 {
        if self.use_preconditioner && self.preconditioner[i] != 0.0 {
            value / self.preconditioner[i]
        } else {
            value
        }
    }

    fn dot_owned_free(&self, a: &[f32], b: &[f32]) -> f64 {
        let mut acc = 0.0f64;
        for i in 0..self.num_variables {
            if self.vertex_type[i] != VERTEX_OUTER_INTERFACE && self.free[i] != 0 {
                acc += f64::from(a[i]) * f64::from(b[i]);
            }
        }
        acc
    }

    fn dot_owned_free_scaled(&self, a: &[f32], b: &[f32]) -> f64 {
        let mut acc = 0.0f64;
        for i in 0..self.num_variables {
            if self.vertex_type[i] != VERTEX_OUTER_INTERFACE && self.free[i] != 0 {
                let product = f64::from(a[i]) * f64::from(b[i]);
                if self.preconditioner[i] != 0.0 {
                    acc += product / f64::from(self.preconditioner[i]);
                } else {
                    acc += product;
                }
            }
        }
        acc
    }

    fn dot_owned_fixed(&self, a: &[f32], b: &[f32]) -> f64 {
        let mut acc = 0.0f64;
        for i in 0..self.num_variables {
            if self.vertex_type[i] != VERTEX_OUTER_INTERFACE && self.free[i] == 0 {
                acc += f64::from(a[i]) * f64::from(b[i]);
            }
        }
        acc
    }

    fn package_inner_interfaces(&self) -> (InterfaceSlice, InterfaceSlice) {
        let mut lo = InterfaceSlice::new(self.nx, self.ny);
        let mut hi = InterfaceSlice::new(self.nx, self.ny);
        for vertex in &self.inner_vertices {
            // A single-plane slab exports the same plane in both
            // directions.
            let is_lo = vertex.z == 1;
            let is_hi = vertex.z == self.nz;
            if !is_lo && !is_hi {
                continue;
            }
            for d in 0..3 {
                let varind = vertex.ref_index + d;
                if self.free[varind] == 0 {
                    continue;
                }
                if is_lo {
                    lo.set(self.p[varind], d, vertex.x - 1, vertex.y - 1);
                }
                if is_hi {
                    hi.set(self.p[varind], d, vertex.x - 1, vertex.y - 1);
                }
            }
        }
        (lo, hi)
    }

    fn element_energy(&self, element: &Element) -> f64 {
        let quad = kernel::element_quadratic_form(&self.stiffness, &self.x, &element.refs);
        -0.5 * f64::from(element.bvf) / 100.0 * quad
    }

    fn update_element_strains(&mut self) {
        let stiffness = Arc::clone(&self.stiffness);
        for element in self.elements.iter_mut() {
            let quad = kernel::element_quadratic_form(&stiffness, &self.x, &element.refs);
            let bvf_factor = f64::from(element.bvf) / 100.0;
            let energy = -0.5 * bvf_factor * quad;
            element.strain = (2.0 * energy.abs()
                / (self.voxel_volume * self.youngs_modulus * bvf_factor))
                .sqrt() as f32;
        }
    }

    #[cfg(test)]
    pub(crate) fn peak_element_strain(&self) -> f32 {
        self.elements
            .iter()
            .fold(0.0f32, |acc, e| acc.max(e.strain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn identity_stiffness() -> Arc<StiffnessMatrix> {
        Arc::new(StiffnessMatrix::from_matrix(&DMatrix::identity(24, 24)).unwrap())
    }

    /// Diagonally dominant symmetric matrix with off-diagonal coupling, so
    /// a displaced DOF actually loads its neighbours.
    fn coupled_stiffness() -> Arc<StiffnessMatrix> {
        let mut m = DMatrix::<f64>::zeros(24, 24);
        for i in 0..24 {
            m[(i, i)] = 8.0;
        }
        for i in 0..24 {
            for j in 0..24 {
                if i != j && (i + j) % 5 == 0 {
                    m[(i, j)] = 1.0;
                }
            }
        }
        Arc::new(StiffnessMatrix::from_matrix(&m).unwrap())
    }

    fn setup_params<'a>(
        grid: &'a VoxelGrid,
        fixed: &'a NodeMask,
        x0: &'a NodeField,
        slab: SlabRange,
    ) -> BlockSetup<'a> {
        BlockSetup {
            grid,
            fixed,
            initial_displacements: x0,
            stiffness: identity_stiffness(),
            youngs_modulus: 1.0,
            voxel_volume: 1.0,
            resolution: [1.0; 3],
            slab,
            use_preconditioner: false,
        }
    }

    #[test]
    fn test_empty_slab_is_a_no_op() {
        let grid = VoxelGrid::new(2, 2, 2);
        let fixed = NodeMask::for_grid(&grid);
        let x0 = NodeField::for_grid(&grid);
        let params = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 0, zmax: 2 });
        assert!(Block::setup(&params).is_none());
    }

    #[test]
    fn test_zero_initial_field_has_zero_residual() {
        let grid = VoxelGrid::from_fn(2, 2, 2, |_, _, _| 100);
        let fixed = NodeMask::for_grid(&grid);
        let x0 = NodeField::for_grid(&grid);
        let params = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 0, zmax: 2 });
        let (block, output) = Block::setup(&params).unwrap();
        assert_relative_eq!(output.rnorm2, 0.0);
        assert_eq!(block.compute_stress(), [0.0; 6]);
    }

    #[test]
    fn test_single_block_owns_every_active_dof() {
        let grid = VoxelGrid::from_fn(2, 2, 2, |_, _, _| 100);
        let fixed = NodeMask::for_grid(&grid);
        let x0 = NodeField::for_grid(&grid);
        let params = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 0, zmax: 2 });
        let (block, _) = Block::setup(&params).unwrap();
        // 3^3 active nodes, 3 DOFs each, all owned by the lone block.
        assert_eq!(block.owned_variable_count(), 27 * 3);
        assert_eq!(block.owned_free_variable_count(), 27 * 3);
        assert_eq!(block.variable_count(), 27 * 3);
    }

    #[test]
    fn test_split_blocks_partition_ownership() {
        let grid = VoxelGrid::from_fn(2, 2, 2, |_, _, _| 100);
        let fixed = NodeMask::for_grid(&grid);
        let x0 = NodeField::for_grid(&grid);
        let lower = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 0, zmax: 1 });
        let upper = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 2, zmax: 2 });
        let (lower, _) = Block::setup(&lower).unwrap();
        let (upper, _) = Block::setup(&upper).unwrap();
        assert_eq!(
            lower.owned_variable_count() + upper.owned_variable_count(),
            27 * 3
        );
        // The upper block mirrors the shared plane as padding.
        assert!(upper.variable_count() > upper.owned_variable_count());
    }

    #[test]
    fn test_initial_displacements_and_fixed_mask_are_honoured() {
        let grid = VoxelGrid::from_fn(2, 2, 2, |_, _, _| 100);
        let mut fixed = NodeMask::for_grid(&grid);
        let mut x0 = NodeField::for_grid(&grid);
        fixed.set(1, 0, 2, 1, 1);
        x0.set(0.25, 0, 2, 1, 1);
        let mut params = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 0, zmax: 2 });
        params.stiffness = coupled_stiffness();
        let (block, output) = Block::setup(&params).unwrap();
        // World node (2,1,1) sits at local (4,3,2).
        assert_relative_eq!(block.displacement(4, 3, 2, 0), 0.25);
        // A fixed, displaced DOF loads its free neighbours: the residual is
        // nonzero somewhere.
        assert!(output.rnorm2 > 0.0);
    }

    #[test]
    fn test_interface_planes_carry_search_direction() {
        let grid = VoxelGrid::from_fn(2, 2, 2, |_, _, _| 100);
        let mut fixed = NodeMask::for_grid(&grid);
        let mut x0 = NodeField::for_grid(&grid);
        // Fix and displace one DOF so p = r is nonzero on free DOFs.
        fixed.set(1, 2, 1, 1, 2);
        x0.set(0.5, 2, 1, 1, 2);
        let mut lower = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 0, zmax: 1 });
        lower.stiffness = coupled_stiffness();
        let (_, output) = Block::setup(&lower).unwrap();
        // The displaced fixed DOF loads free DOFs through the off-diagonal
        // coupling; the exported hi plane (world z=1) carries the resulting
        // search direction.
        let (snx, sny) = output.inner_hi.dims();
        let mut any_nonzero = false;
        for y in 0..sny {
            for x in 0..snx {
                for d in 0..3 {
                    if output.inner_hi.value(d, x, y) != 0.0 {
                        any_nonzero = true;
                    }
                }
            }
        }
        assert!(any_nonzero);
    }

    #[test]
    fn test_collect_displacements_covers_owned_planes_only() {
        let grid = VoxelGrid::from_fn(2, 2, 2, |_, _, _| 100);
        let fixed = NodeMask::for_grid(&grid);
        let mut x0 = NodeField::for_grid(&grid);
        for z in 0..=2usize {
            for y in 0..=2usize {
                for x in 0..=2usize {
                    x0.set(z as f32, 2, x, y, z);
                }
            }
        }
        let lower_params = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 0, zmax: 1 });
        let upper_params = setup_params(&grid, &fixed, &x0, SlabRange { zmin: 2, zmax: 2 });
        let (lower, _) = Block::setup(&lower_params).unwrap();
        let (upper, _) = Block::setup(&upper_params).unwrap();
        let mut out = NodeField::for_grid(&grid);
        lower.collect_displacements(&mut out);
        upper.collect_displacements(&mut out);
        for z in 0..=2 {
            assert_relative_eq!(out.value(2, 1, 1, z), z as f32);
        }
    }
}
