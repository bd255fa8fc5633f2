//! Matrix-free linear least squares with the CRLS Krylov method.
//!
//! This crate minimizes `‖Ax − b‖² + λ‖x‖²` using the conjugate residual
//! method applied to the normal equations `(AᴴA + λI) x = Aᴴb`, without ever
//! forming `AᴴA`. The operator is only touched through products with `A` and
//! `Aᴴ`, so dense, sparse and implicit operators all work.
//!
//! How it works (high level):
//! - Start from `x = 0`, `r = b` and the gradient `Aᴴr`.
//! - Each iteration takes a conjugate-residual step along `p`, updating
//!   `x`, `r` and `Aᴴr` by short recurrences.
//! - An optional trust region `‖x‖ ≤ radius` clips the step at the boundary and
//!   detects directions of zero curvature.
//! - Stop when `‖Aᴴr‖ ≤ atol + rtol ‖Aᴴb‖`, at the boundary, when the budget
//!   runs out, when the callback asks to, or as soon as `‖Aᴴr‖`, `γ` or `‖q‖`
//!   stop being finite.
//!
//! Calling it:
//! - Implement [`LinearOperator`] (or use a faer `Mat`/`MatRef` or a [`CscOperator`]).
//! - Call [`solve`], or build a [`CrlsSolver`] once and call
//!   [`CrlsSolver::solve_inplace`] repeatedly to reuse its storage.
//! - Inspect [`SolverStats`].
//!
//! Example:
//! ```rust,no_run
//! use crls_rs::{solve, SolveStatus, SolverOptions};
//! use faer_core::mat;
//!
//! let a = mat![[1.0f64, 0.0], [0.0, 2.0], [1.0, 1.0]];
//! let b = [1.0, 4.0, 3.0];
//! let (x, stats) = solve(&a, &b, &SolverOptions::default()).unwrap();
//! assert_eq!(stats.status, SolveStatus::Converged);
//! assert!((x[0] - 1.0).abs() < 1e-6 && (x[1] - 2.0).abs() < 1e-6);
//! ```

mod operator;
mod report;
mod solver;
mod sparse;
mod trust_region;
mod vector;

pub use operator::{
    DiagonalPreconditioner, LinearOperator, Preconditioner, PreconditionerError,
    PreconditionerMode,
};
pub use report::{
    IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter, TableReporter,
};
pub use solver::{solve, CrlsSolver, SolveError, SolverOptions, SolverState};
pub use sparse::{CscOperator, PatternError, SparseError, SparsityPattern};
pub use trust_region::TrustRegion;
