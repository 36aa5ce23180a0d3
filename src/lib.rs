//! voxfem - parallel micro-FE solver for voxelised elastic media
//!
//! Iterative solver for the linear elasticity equations on a regular voxel
//! grid, aimed at microscale finite-element analysis of heterogeneous
//! materials (trabecular bone, composites). Features:
//!
//! - Matrix-free preconditioned conjugate gradients over 8-node hexahedral
//!   voxel elements, one shared 24x24 stiffness scaled per element by its
//!   volume fraction
//! - Shared-memory domain decomposition into z-slabs with two parallel
//!   phases per iteration (Rayon), exchanging only thin interface planes
//! - Dirichlet boundary conditions derived from an imposed macroscopic
//!   strain; outputs are the displacement field, reaction forces, element
//!   energies and the volume-averaged stress tensor
//! - Convergence detection on the macroscopic stress sequence rather than
//!   the raw residual
//! - Optional nonlinear continuation that softens elements by accumulated
//!   strain
//!
//! # Architecture
//!
//! - [`VoxelGrid`], [`NodeField`], [`NodeMask`]: the voxel domain and the
//!   dense nodal fields the solver consumes and produces
//! - [`StiffnessMatrix`]: the validated elemental stiffness constant
//! - [`MacroscopicStrain`]: imposed-strain descriptor and Dirichlet builders
//! - [`Block`]: one z-slab of per-DOF state and the step A / step B kernels
//! - [`BlockSolver`]: the coordinator driving decomposition, the two-phase
//!   iteration protocol and the nonlinear loop
//! - [`ErrorEstimator`]: the stress-sequence convergence oracle
//! - [`StiffnessAdjuster`]: strain-to-stiffness damage laws

pub mod adjuster;
pub mod block;
pub mod boundary;
pub mod error;
pub mod estimator;
pub mod grid;
pub mod interface;
pub mod kernel;
pub mod partition;
pub mod solver;
pub mod stiffness;
pub mod types;

#[cfg(test)]
mod test_util;

pub use adjuster::{LinearSoftening, StiffnessAdjuster};
pub use block::{Block, BlockSetup, SetupOutput, StepA, StepB};
pub use boundary::{build_fixed_mask, build_initial_displacements, MacroscopicStrain};
pub use error::{Error, Result};
pub use estimator::ErrorEstimator;
pub use grid::{ElementField, NodeArray, NodeField, NodeMask, VoxelGrid};
pub use interface::InterfaceSlice;
pub use partition::{decompose, slice_vertex_counts, SlabRange};
pub use solver::{BlockSolver, SolverConfig};
pub use stiffness::{StiffnessMatrix, ELEMENT_DOFS};
pub use types::{SolveReport, StressTensor};
