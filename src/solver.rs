//! Block-decomposed PCG coordinator.
//!
//! The solver splits the voxel grid into z-slabs, hands each slab to a
//! [`Block`], and drives the preconditioned conjugate-gradient iteration in
//! two parallel phases per step:
//!
//! 1. serial: stage each block's neighbour search-direction planes
//! 2. parallel step A: import planes, matvec, partial inner products
//! 3. serial: reduce the inner products, derive alpha and beta
//! 4. parallel step B: advance x/r/p, partial stress, export planes
//! 5. serial: publish planes, feed the stress to the error estimator
//!
//! The serial phases on the coordinator are the only synchronisation
//! boundary; blocks never touch each other's memory. Iteration stops when
//! the estimated relative stress error stays below epsilon for five
//! consecutive iterations or the iteration budget runs out; an initial
//! state that already satisfies equilibrium skips the loop entirely.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::adjuster::{LinearSoftening, StiffnessAdjuster};
use crate::block::{Block, BlockSetup, StepA, StepB};
use crate::boundary::{self, MacroscopicStrain};
use crate::error::{Error, Result};
use crate::estimator::ErrorEstimator;
use crate::grid::{ElementField, NodeField, NodeMask, VoxelGrid};
use crate::interface::InterfaceSlice;
use crate::partition;
use crate::stiffness::StiffnessMatrix;
use crate::types::{SolveReport, StressTensor};

/// Iteration and decomposition configuration.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Convergence threshold on the estimated relative stress error.
    pub epsilon: f64,
    /// Iteration budget; 0 means unbounded.
    pub max_iterations: usize,
    /// Worker threads; blocks are decomposed to match.
    pub num_threads: usize,
    /// Use the Jacobi diagonal preconditioner.
    pub use_preconditioner: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            epsilon: 1e-3,
            max_iterations: 0,
            num_threads: 1,
            use_preconditioner: false,
        }
    }
}

impl SolverConfig {
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_preconditioner(mut self, use_preconditioner: bool) -> Self {
        self.use_preconditioner = use_preconditioner;
        self
    }
}

/// Parallel solver for the voxel elasticity system.
pub struct BlockSolver {
    config: SolverConfig,
    grid: VoxelGrid,
    stiffness: Arc<StiffnessMatrix>,
    youngs_modulus: f64,
    voxel_volume: f64,
    resolution: [f64; 3],
    fixed: NodeMask,
    initial_displacements: NodeField,
    blocks: Vec<Block>,
    /// Inner-interface planes (lo, hi) exported by each block, consulted
    /// when staging the next step A.
    published: Vec<(InterfaceSlice, InterfaceSlice)>,
    partial_stresses: Vec<[f64; 6]>,
    num_iterations: usize,
    estimator: ErrorEstimator,
    adjuster: Option<Arc<dyn StiffnessAdjuster>>,
}

impl BlockSolver {
    /// Create a solver for the given domain and elemental stiffness.
    ///
    /// Young's modulus, voxel volume and resolution default to 1; set them
    /// before deriving strain-based boundary data.
    pub fn new(grid: VoxelGrid, stiffness: StiffnessMatrix, config: SolverConfig) -> Self {
        let fixed = NodeMask::for_grid(&grid);
        let initial_displacements = NodeField::for_grid(&grid);
        Self {
            config,
            grid,
            stiffness: Arc::new(stiffness),
            youngs_modulus: 1.0,
            voxel_volume: 1.0,
            resolution: [1.0; 3],
            fixed,
            initial_displacements,
            blocks: Vec::new(),
            published: Vec::new(),
            partial_stresses: Vec::new(),
            num_iterations: 0,
            estimator: ErrorEstimator::new(),
            adjuster: None,
        }
    }

    /// Young's modulus, used only for the element strain estimate of the
    /// nonlinear continuation.
    pub fn set_youngs_modulus(&mut self, value: f64) {
        self.youngs_modulus = value;
    }

    /// Volume of one voxel, used by the element strain estimate.
    pub fn set_voxel_volume(&mut self, value: f64) {
        self.voxel_volume = value;
    }

    /// Physical edge lengths of one voxel.
    pub fn set_resolution(&mut self, resolution: [f64; 3]) {
        self.resolution = resolution;
    }

    /// Install an explicit Dirichlet mask.
    pub fn set_fixed_variables(&mut self, fixed: NodeMask) -> Result<()> {
        if !fixed.matches_grid(&self.grid) {
            return Err(Error::InvalidInput(
                "fixed-variable mask does not match the voxel grid".into(),
            ));
        }
        self.fixed = fixed;
        Ok(())
    }

    /// Derive the Dirichlet mask from a macroscopic strain descriptor.
    pub fn fix_boundaries(&mut self, strain: &MacroscopicStrain) {
        self.fixed = boundary::build_fixed_mask(&self.grid, strain);
    }

    /// Install an explicit initial displacement field. Fixed DOFs must
    /// carry their Dirichlet values; free DOFs hold the initial guess.
    pub fn set_initial_displacements(&mut self, displacements: NodeField) -> Result<()> {
        if !displacements.matches_grid(&self.grid) {
            return Err(Error::InvalidInput(
                "initial displacement field does not match the voxel grid".into(),
            ));
        }
        self.initial_displacements = displacements;
        Ok(())
    }

    /// Derive the affine initial displacement field (and Dirichlet values)
    /// from a macroscopic strain descriptor. Set the resolution first.
    pub fn set_initial_displacements_from_strain(&mut self, strain: &MacroscopicStrain) {
        self.initial_displacements =
            boundary::build_initial_displacements(&self.grid, &self.resolution, strain);
    }

    /// Overwrite the initial guess on free DOFs only, leaving imposed
    /// Dirichlet values untouched.
    pub fn set_initial_displacements_on_free_variables(
        &mut self,
        displacements: &NodeField,
    ) -> Result<()> {
        if !displacements.matches_grid(&self.grid) {
            return Err(Error::InvalidInput(
                "initial displacement field does not match the voxel grid".into(),
            ));
        }
        let (m1, m2, m3) = self.initial_displacements.node_dims();
        for z in 0..m3 {
            for y in 0..m2 {
                for x in 0..m1 {
                    for d in 0..3 {
                        if self.fixed.value(d, x as i64, y as i64, z as i64) == 0 {
                            let value = displacements.value(d, x as i64, y as i64, z as i64);
                            self.initial_displacements.set(value, d, x, y, z);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the linear solve: decompose, build blocks, iterate to
    /// convergence or the iteration budget.
    pub fn solve(&mut self) -> Result<SolveReport> {
        self.validate()?;
        let start = Instant::now();
        let pool = build_pool(self.config.num_threads)?;

        self.num_iterations = 0;
        self.estimator.reset();
        let rnorm2 = self.setup_blocks()?;

        if self.blocks.is_empty() {
            warn!("domain has no occupied voxels; returning zero solution");
            return Ok(SolveReport {
                iterations: 0,
                converged: true,
                relative_error: 0.0,
                solve_time: start.elapsed().as_secs_f64(),
            });
        }
        if rnorm2 == 0.0 {
            // The initial field already satisfies equilibrium.
            return Ok(SolveReport {
                iterations: 0,
                converged: true,
                relative_error: 0.0,
                solve_time: start.elapsed().as_secs_f64(),
            });
        }

        let (converged, relative_error) = self.run_iterations(&pool)?;
        Ok(SolveReport {
            iterations: self.num_iterations,
            converged,
            relative_error,
            solve_time: start.elapsed().as_secs_f64(),
        })
    }

    /// Nonlinear continuation: one linear solve, then `num_steps` rounds of
    /// strain-softened re-iteration with a fixed per-step budget.
    ///
    /// Step `s` models an imposed macroscopic strain of `s * step_size` and
    /// installs a [`LinearSoftening`] law with `eps_yield = 0.01 / (s *
    /// step_size)`. Advancing the imposed Dirichlet values between steps is
    /// the caller's responsibility (through the displacement setters).
    ///
    /// Returns the converged stress after the linear solve followed by the
    /// stress after each continuation step.
    pub fn solve_nonlinear(
        &mut self,
        step_size: f32,
        num_steps: usize,
        num_iterations_per_step: usize,
    ) -> Result<Vec<StressTensor>> {
        if !(step_size > 0.0 && step_size.is_finite()) {
            return Err(Error::InvalidInput("step_size must be positive".into()));
        }
        self.solve()?;
        let mut stresses = vec![self.stress()];
        let saved = (self.config.epsilon, self.config.max_iterations);
        let result =
            self.run_nonlinear_steps(step_size, num_steps, num_iterations_per_step, &mut stresses);
        self.config.epsilon = saved.0;
        self.config.max_iterations = saved.1;
        self.adjuster = None;
        result.map(|()| stresses)
    }

    /// Volume-averaged macroscopic stress from the latest iteration.
    /// Repeated calls without iterating return the same value.
    pub fn stress(&self) -> StressTensor {
        let (n1, n2, n3) = self.grid.dims();
        let volume = (n1 * n2 * n3) as f64 * self.resolution.iter().product::<f64>();
        if volume == 0.0 {
            return StressTensor::zero();
        }
        let mut total = [0.0f64; 6];
        for partial in &self.partial_stresses {
            for (sum, value) in total.iter_mut().zip(partial.iter()) {
                *sum += value;
            }
        }
        StressTensor::new(total.map(|v| v / volume))
    }

    /// Nodal displacement field assembled from the blocks.
    pub fn displacements(&self) -> NodeField {
        let mut out = NodeField::for_grid(&self.grid);
        for block in &self.blocks {
            block.collect_displacements(&mut out);
        }
        out
    }

    /// Nodal residual field; at convergence this is the negative of the
    /// constraint reaction on fixed DOFs and zero elsewhere.
    pub fn forces(&self) -> NodeField {
        let mut out = NodeField::for_grid(&self.grid);
        for block in &self.blocks {
            block.collect_forces(&mut out);
        }
        out
    }

    /// Per-element strain energy map (negative by convention).
    pub fn energy(&self) -> ElementField {
        let mut out = ElementField::for_grid(&self.grid);
        for block in &self.blocks {
            block.collect_energy(&mut out);
        }
        out
    }

    /// Iterations performed by the most recent solve (or continuation
    /// step).
    pub fn num_iterations(&self) -> usize {
        self.num_iterations
    }

    /// The convergence oracle and its recorded stress history.
    pub fn error_estimator(&self) -> &ErrorEstimator {
        &self.estimator
    }

    /// Current configuration.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// The blocks of the current decomposition (empty before `solve`).
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    fn validate(&self) -> Result<()> {
        if self.config.num_threads < 1 {
            return Err(Error::InvalidInput("num_threads must be at least 1".into()));
        }
        if !(self.config.epsilon >= 0.0 && self.config.epsilon.is_finite()) {
            return Err(Error::InvalidInput("epsilon must be finite and non-negative".into()));
        }
        if !(self.youngs_modulus > 0.0 && self.youngs_modulus.is_finite()) {
            return Err(Error::InvalidInput("Young's modulus must be positive".into()));
        }
        if !(self.voxel_volume > 0.0 && self.voxel_volume.is_finite()) {
            return Err(Error::InvalidInput("voxel volume must be positive".into()));
        }
        if self.resolution.iter().any(|&h| !(h > 0.0 && h.is_finite())) {
            return Err(Error::InvalidInput("resolution must be positive".into()));
        }
        if !self.fixed.matches_grid(&self.grid) {
            return Err(Error::InvalidInput(
                "fixed-variable mask does not match the voxel grid".into(),
            ));
        }
        if !self.initial_displacements.matches_grid(&self.grid) {
            return Err(Error::InvalidInput(
                "initial displacement field does not match the voxel grid".into(),
            ));
        }
        Ok(())
    }

    /// Decompose the grid and build one block per non-empty slab. Returns
    /// the summed owned-free residual norm of the initial state.
    fn setup_blocks(&mut self) -> Result<f64> {
        self.blocks.clear();
        self.published.clear();
        let ranges = partition::decompose(&self.grid, self.config.num_threads);
        let mut rnorm2 = 0.0f64;
        for slab in ranges {
            let params = BlockSetup {
                grid: &self.grid,
                fixed: &self.fixed,
                initial_displacements: &self.initial_displacements,
                stiffness: Arc::clone(&self.stiffness),
                youngs_modulus: self.youngs_modulus,
                voxel_volume: self.voxel_volume,
                resolution: self.resolution,
                slab,
                use_preconditioner: self.config.use_preconditioner,
            };
            match Block::setup(&params) {
                Some((block, output)) => {
                    rnorm2 += output.rnorm2;
                    self.published.push((output.inner_lo, output.inner_hi));
                    self.blocks.push(block);
                }
                None => {
                    debug!(
                        "slab z {}..={} has no active nodes; omitted",
                        slab.zmin, slab.zmax
                    );
                }
            }
        }
        self.partial_stresses = vec![[0.0; 6]; self.blocks.len()];
        if !rnorm2.is_finite() {
            return Err(Error::NonFinite {
                what: "initial residual norm",
                iteration: 0,
            });
        }
        let total_free: usize = self
            .blocks
            .iter()
            .map(|b| b.owned_free_variable_count())
            .sum();
        info!(
            "solving {} free variables across {} blocks",
            total_free,
            self.blocks.len()
        );
        Ok(rnorm2)
    }

    fn run_nonlinear_steps(
        &mut self,
        step_size: f32,
        num_steps: usize,
        num_iterations_per_step: usize,
        stresses: &mut Vec<StressTensor>,
    ) -> Result<()> {
        if self.blocks.is_empty() {
            return Ok(());
        }
        let pool = build_pool(self.config.num_threads)?;
        for step in 1..=num_steps {
            let eps = step_size * step as f32;
            self.adjuster = Some(Arc::new(LinearSoftening::new(0.01 / eps)));
            // Disable the convergence exit: each step runs its full budget
            // so the softened state settles before the strain advances.
            self.config.epsilon = 0.0;
            self.config.max_iterations = num_iterations_per_step;
            self.num_iterations = 0;
            self.run_iterations(&pool)?;
            let stress = self.stress();
            info!(
                "continuation step {step}: macroscopic strain {eps:.5}, stress {:?}",
                stress.components()
            );
            stresses.push(stress);
        }
        Ok(())
    }

    fn run_iterations(&mut self, pool: &rayon::ThreadPool) -> Result<(bool, f64)> {
        for block in &mut self.blocks {
            block.set_adjuster(self.adjuster.clone());
        }
        let max_iterations = self.config.max_iterations;
        let epsilon = self.config.epsilon;
        let mut below_count = 0usize;
        let mut relative_error = f64::INFINITY;

        while (max_iterations == 0 || self.num_iterations < max_iterations) && below_count < 5 {
            let iteration = self.num_iterations;

            // Step A: each block imports its neighbours' published planes
            // from the previous iteration and applies the operator.
            let step_a: Vec<StepA> = {
                let blocks = &mut self.blocks;
                let published = &self.published;
                pool.install(|| {
                    blocks
                        .par_iter_mut()
                        .enumerate()
                        .map(|(i, block)| {
                            let lo = if i > 0 { Some(&published[i - 1].1) } else { None };
                            let hi = published.get(i + 1).map(|planes| &planes.0);
                            block.iterate_step_a(lo, hi)
                        })
                        .collect()
                })
            };

            let r_z: f64 = step_a.iter().map(|s| s.r_z).sum();
            let r_ap: f64 = step_a.iter().map(|s| s.r_ap).sum();
            let p_ap: f64 = step_a.iter().map(|s| s.p_ap).sum();
            let ap_ap: f64 = step_a.iter().map(|s| s.ap_ap).sum();
            for (value, what) in [
                (r_z, "r*z inner product"),
                (r_ap, "r*Ap inner product"),
                (p_ap, "p*Ap inner product"),
                (ap_ap, "Ap*Ap inner product"),
            ] {
                if !value.is_finite() {
                    return Err(Error::NonFinite { what, iteration });
                }
            }
            if p_ap == 0.0 && r_z != 0.0 {
                return Err(Error::DegenerateSearchDirection { iteration });
            }

            // An exactly-zero residual still runs step B with alpha = beta
            // = 0: the state is stationary, the stress republishes
            // unchanged, and the estimator drives the exit.
            let alpha = if p_ap != 0.0 { r_z / p_ap } else { 0.0 };
            let beta = if r_z != 0.0 {
                (r_z - 2.0 * alpha * r_ap + alpha * alpha * ap_ap) / r_z
            } else {
                0.0
            };
            if !alpha.is_finite() || !beta.is_finite() {
                return Err(Error::NonFinite {
                    what: "CG scalar",
                    iteration,
                });
            }

            // Step B: advance the recurrences and export fresh planes.
            let step_b: Vec<StepB> = {
                let blocks = &mut self.blocks;
                pool.install(|| {
                    blocks
                        .par_iter_mut()
                        .map(|block| block.iterate_step_b(alpha, beta))
                        .collect()
                })
            };

            let mut r_r = 0.0f64;
            let mut reaction_norm2 = 0.0f64;
            for (i, output) in step_b.into_iter().enumerate() {
                r_r += output.r_r;
                reaction_norm2 += output.bb_bb;
                self.partial_stresses[i] = output.stress;
                self.published[i] = (output.inner_lo, output.inner_hi);
            }

            self.num_iterations += 1;
            let stress = self.stress();
            self.estimator.add_stress_data(&stress);
            let estimate = self.estimator.estimated_relative_error();
            relative_error = estimate;
            debug!(
                "iteration {}: alpha {:.4e}, beta {:.4e}, |r|^2 {:.4e}, |reaction|^2 {:.4e}, est. rel. err. {:.4e}",
                self.num_iterations, alpha, beta, r_r, reaction_norm2, estimate
            );
            if estimate < epsilon {
                below_count += 1;
            } else {
                below_count = 0;
            }
        }

        Ok((below_count >= 5, relative_error))
    }
}

fn build_pool(num_threads: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
        .map_err(|e| Error::ThreadPool(e.to_string()))
}
