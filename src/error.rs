//! Error types for voxfem operations.

use thiserror::Error;

/// Result type alias using the voxfem Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the solver.
///
/// Numerical failures inside the iteration loop halt it and surface here;
/// the blocks' accumulated state (displacements, residuals) stays
/// inspectable on the solver afterwards. There are no retries.
#[derive(Error, Debug)]
pub enum Error {
    /// Inconsistent input shapes or invalid configuration, rejected before
    /// any iteration begins.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The search direction became A-orthogonal to itself (p·Ap = 0) while
    /// the residual was still nonzero. Treated as divergence.
    #[error("degenerate search direction at iteration {iteration}: p*Ap = 0 with nonzero residual")]
    DegenerateSearchDirection { iteration: usize },

    /// A reduced scalar came back NaN or infinite, indicating numerical
    /// breakdown (bad stiffness matrix or Dirichlet data).
    #[error("non-finite {what} at iteration {iteration}")]
    NonFinite {
        what: &'static str,
        iteration: usize,
    },

    /// Worker thread pool construction failed.
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}
