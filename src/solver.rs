use core::fmt;

use faer_core::{ComplexField, Parallelism, RealField};
use std::time::Instant;

use crate::operator::{precondition, LinearOperator, Preconditioner, PreconditionerMode};
use crate::report::{emit_line, IterationReport, Reporter, SolveStatus, SolverStats, StdoutReporter};
use crate::trust_region::TrustRegion;
use crate::vector::{axpy, dotr, fill_zero, is_finite_real, norm2, norm2_squared, xpby};

/// Configuration errors, detected before any operator is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveError {
    /// The operator shape differs from the workspace shape.
    OperatorShape {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    /// `b` does not have one entry per operator row.
    RhsLength { expected: usize, actual: usize },
    /// The preconditioner does not act on the residual space.
    PreconditionerDimension { expected: usize, actual: usize },
    /// A real parameter is negative, infinite or NaN.
    InvalidParameter { name: &'static str },
}

impl fmt::Display for SolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OperatorShape { expected, actual } => write!(
                f,
                "operator is {}x{} but the workspace was built for {}x{}",
                actual.0, actual.1, expected.0, expected.1
            ),
            Self::RhsLength { expected, actual } => {
                write!(f, "b length {actual} does not match expected {expected}")
            }
            Self::PreconditionerDimension { expected, actual } => {
                write!(f, "preconditioner dimension {actual} does not match expected {expected}")
            }
            Self::InvalidParameter { name } => {
                write!(f, "{name} must be finite and non-negative")
            }
        }
    }
}

impl std::error::Error for SolveError {}

/// Read-only view of the iteration handed to the callback.
pub struct SolverState<'a, E: ComplexField> {
    pub iteration: usize,
    pub x: &'a [E],
    pub r: &'a [E],
    /// Normal-equation gradient `Aᴴr` (preconditioned when `M` is present).
    pub ar: &'a [E],
    pub ar_norm: E::Real,
    pub r_norm: E::Real,
}

/// Options controlling a CRLS solve.
#[derive(Clone)]
pub struct SolverOptions<'a, E: ComplexField> {
    /// Residual-space preconditioner; `None` is the identity.
    pub preconditioner: Option<&'a dyn Preconditioner<E>>,
    /// Whether `M` is multiplied or solved with.
    pub preconditioner_mode: PreconditionerMode,
    /// Ridge weight: minimize ‖Ax − b‖² + λ‖x‖².
    pub lambda: E::Real,
    /// Converge when ‖Aᴴr‖ <= atol + rtol * ‖Aᴴb‖.
    pub atol: E::Real,
    pub rtol: E::Real,
    /// Trust-region radius on ‖x‖; zero disables the constraint.
    pub radius: E::Real,
    /// Iteration budget; zero means m + n.
    pub itmax: usize,
    /// Print a line every `verbose` iterations; zero is silent.
    pub verbose: usize,
    /// Record ‖r‖ and ‖Aᴴr‖ for every iteration.
    pub history: bool,
    /// Called after each completed iteration; returning true stops the solve.
    pub callback: Option<&'a dyn Fn(&SolverState<'_, E>) -> bool>,
}

impl<E: ComplexField> Default for SolverOptions<'_, E> {
    fn default() -> Self {
        let tol = E::Real::faer_epsilon()
            .unwrap_or_else(E::Real::faer_zero)
            .faer_sqrt();
        Self {
            preconditioner: None,
            preconditioner_mode: PreconditionerMode::Multiply,
            lambda: E::Real::faer_zero(),
            atol: tol,
            rtol: tol,
            radius: E::Real::faer_zero(),
            itmax: 0,
            verbose: 0,
            history: false,
            callback: None,
        }
    }
}

impl<E: ComplexField> fmt::Debug for SolverOptions<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverOptions")
            .field("preconditioner", &self.preconditioner.is_some())
            .field("preconditioner_mode", &self.preconditioner_mode)
            .field("lambda", &self.lambda)
            .field("atol", &self.atol)
            .field("rtol", &self.rtol)
            .field("radius", &self.radius)
            .field("itmax", &self.itmax)
            .field("verbose", &self.verbose)
            .field("history", &self.history)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// CRLS workspace for least-squares problems with an `m x n` operator.
///
/// Owns every iteration vector and the diagnostics of the last solve, so
/// repeated solves on operators of the same shape do not allocate. The
/// preconditioned buffers are only allocated once a preconditioner is used.
pub struct CrlsSolver<E: ComplexField> {
    nrows: usize,
    ncols: usize,
    parallelism: Parallelism,
    x: Vec<E>,
    r: Vec<E>,
    ar: Vec<E>,
    p: Vec<E>,
    ap: Vec<E>,
    q: Vec<E>,
    s: Vec<E>,
    mr: Vec<E>,
    ms: Vec<E>,
    map: Vec<E>,
    stats: SolverStats<E::Real>,
}

enum ReporterSlot<'a, R> {
    External(&'a mut dyn Reporter<R>),
    Local(StdoutReporter),
    None,
}

impl<'a, R: fmt::LowerExp> ReporterSlot<'a, R> {
    fn new(reporter: Option<&'a mut dyn Reporter<R>>, verbose: usize) -> Self {
        match reporter {
            Some(r) => Self::External(r),
            None if verbose > 0 => Self::Local(StdoutReporter::new(verbose)),
            None => Self::None,
        }
    }

    fn as_mut(&mut self) -> Option<&mut dyn Reporter<R>> {
        match self {
            Self::External(r) => Some(&mut **r),
            Self::Local(r) => Some(r),
            Self::None => None,
        }
    }
}

impl<E: ComplexField> CrlsSolver<E>
where
    E::Real: fmt::LowerExp,
{
    /// Create a workspace for `nrows x ncols` operators.
    ///
    /// `parallelism` is forwarded to every operator product.
    pub fn new(nrows: usize, ncols: usize, parallelism: Parallelism) -> Self {
        let zero = E::faer_zero();
        Self {
            nrows,
            ncols,
            parallelism,
            x: vec![zero; ncols],
            r: vec![zero; nrows],
            ar: vec![zero; ncols],
            p: vec![zero; ncols],
            ap: vec![zero; nrows],
            q: vec![zero; ncols],
            s: vec![zero; nrows],
            mr: Vec::new(),
            ms: Vec::new(),
            map: Vec::new(),
            stats: SolverStats::new(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Solution of the last solve.
    pub fn x(&self) -> &[E] {
        &self.x
    }

    /// Diagnostics of the last solve.
    pub fn stats(&self) -> &SolverStats<E::Real> {
        &self.stats
    }

    /// Consumes the workspace, returning the last solution and its diagnostics.
    pub fn into_parts(self) -> (Vec<E>, SolverStats<E::Real>) {
        (self.x, self.stats)
    }

    fn check(
        &self,
        a: &(impl LinearOperator<E> + ?Sized),
        b: &[E],
        options: &SolverOptions<'_, E>,
    ) -> Result<(), SolveError> {
        if a.nrows() != self.nrows || a.ncols() != self.ncols {
            return Err(SolveError::OperatorShape {
                expected: (self.nrows, self.ncols),
                actual: (a.nrows(), a.ncols()),
            });
        }
        if b.len() != self.nrows {
            return Err(SolveError::RhsLength {
                expected: self.nrows,
                actual: b.len(),
            });
        }
        if let Some(m) = options.preconditioner {
            if m.dim() != self.nrows {
                return Err(SolveError::PreconditionerDimension {
                    expected: self.nrows,
                    actual: m.dim(),
                });
            }
        }
        let params = [
            ("lambda", options.lambda),
            ("atol", options.atol),
            ("rtol", options.rtol),
            ("radius", options.radius),
        ];
        for (name, value) in params {
            if !(is_finite_real(value) && value >= E::Real::faer_zero()) {
                return Err(SolveError::InvalidParameter { name });
            }
        }
        Ok(())
    }

    /// Solve min ‖Ax − b‖² + λ‖x‖² with CRLS, starting from x = 0.
    ///
    /// The solution is left in [`CrlsSolver::x`]. Non-convergence, zero
    /// curvature, the trust-region boundary, callback exits and non-finite
    /// breakdowns are reported through the returned status; only
    /// configuration errors fail.
    pub fn solve_inplace(
        &mut self,
        a: &(impl LinearOperator<E> + ?Sized),
        b: &[E],
        options: &SolverOptions<'_, E>,
        reporter: Option<&mut dyn Reporter<E::Real>>,
    ) -> Result<&SolverStats<E::Real>, SolveError> {
        if let Err(err) = self.check(a, b, options) {
            log::debug!("crls rejected configuration: {err}");
            return Err(err);
        }
        let start_time = (options.verbose > 0).then(Instant::now);
        let mut reporter = ReporterSlot::new(reporter, options.verbose);

        let m = self.nrows;
        let n = self.ncols;
        let precond = options.preconditioner;
        if precond.is_some() && self.mr.len() != m {
            self.mr = vec![E::faer_zero(); m];
            self.ms = vec![E::faer_zero(); m];
            self.map = vec![E::faer_zero(); m];
        }

        let Self {
            parallelism,
            x,
            r,
            ar,
            p,
            ap,
            q,
            s,
            mr,
            ms,
            map,
            stats,
            ..
        } = &mut *self;
        let par = *parallelism;
        let mode = options.preconditioner_mode;
        let zero = E::Real::faer_zero();
        let lambda = options.lambda;
        let regularized = lambda > zero;
        let history = options.history;
        let itmax = if options.itmax == 0 { m + n } else { options.itmax };
        let trust_region = TrustRegion::new(options.radius);

        stats.reset();
        fill_zero(x);
        r.copy_from_slice(b);
        let b_norm = norm2(r);
        if b_norm == zero {
            stats.solved = true;
            stats.status = SolveStatus::ZeroResidual;
            if history {
                stats.aresiduals.push(zero);
            }
            finish(stats, start_time, &mut reporter);
            return Ok(&*stats);
        }

        // Ar = Aᴴ M r, s = A Ar.
        match precond {
            Some(pc) => {
                precondition(pc, mode, mr, r);
                a.adjoint_apply(ar, mr, par);
            }
            None => a.adjoint_apply(ar, r, par),
        }
        a.apply(s, ar, par);
        if let Some(pc) = precond {
            precondition(pc, mode, ms, s);
        }

        p.copy_from_slice(ar);
        ap.copy_from_slice(s);
        let ms_ref: &[E] = if precond.is_some() { &ms[..] } else { &s[..] };
        a.adjoint_apply(q, ms_ref, par);
        if regularized {
            axpy(lambda, p, q);
        }
        let mut gamma = dotr(s, ms_ref);

        let mut r_norm = b_norm;
        let mut ar_norm = norm2(ar);
        if regularized {
            gamma = gamma.faer_add(lambda.faer_mul(ar_norm).faer_mul(ar_norm));
        }
        if history {
            stats.residuals.push(r_norm);
            stats.aresiduals.push(ar_norm);
        }
        let eps = options.atol.faer_add(options.rtol.faer_mul(ar_norm));
        if let Some(rep) = reporter.as_mut() {
            rep.on_iteration(&IterationReport {
                iteration: 0,
                ar_norm,
                r_norm,
            });
        }

        let mut iter = 0;
        // An infinite ‖Aᴴr‖ also makes eps infinite, so test finiteness first.
        let mut breakdown = !(is_finite_real(ar_norm) && is_finite_real(gamma));
        let mut solved = !breakdown && ar_norm <= eps;
        let mut tired = iter >= itmax;
        let mut zero_curvature = false;
        let mut on_boundary = false;
        let mut user_exit = false;

        while !(solved || tired || user_exit || breakdown) {
            let q_norm2 = norm2_squared(q);
            if !(is_finite_real(q_norm2) && is_finite_real(gamma)) {
                breakdown = true;
                break;
            }
            if !(q_norm2 > zero && gamma > zero) {
                // AᴴMA + λI annihilates p: no step can decrease the gradient.
                zero_curvature = true;
                solved = true;
                break;
            }
            let mut alpha = gamma.faer_div(q_norm2);

            if trust_region.is_active() {
                let p_norm = norm2(p);
                let flat = eps.faer_mul(q_norm2.faer_sqrt()).faer_mul(p_norm);
                if dotr(&ap[..], &ap[..]) <= flat {
                    // Restart along Aᴴr, where the quadratic is minimal at ‖Aᴴr‖²/γ.
                    zero_curvature = true;
                    let ms_ref: &[E] = if precond.is_some() { &ms[..] } else { &s[..] };
                    a.adjoint_apply(q, ms_ref, par);
                    if regularized {
                        axpy(lambda, ar, q);
                    }
                    let ar_norm2 = ar_norm.faer_mul(ar_norm);
                    let unconstrained = ar_norm2.faer_div(gamma);
                    let sigma = trust_region.step_to_boundary(x, ar, ar_norm2);
                    alpha = if unconstrained < sigma { unconstrained } else { sigma };
                    axpy(alpha, ar, x);
                } else {
                    let sigma = trust_region.step_to_boundary(x, p, p_norm.faer_mul(p_norm));
                    if alpha >= sigma {
                        alpha = sigma;
                        on_boundary = true;
                    }
                    axpy(alpha, p, x);
                }
            } else {
                axpy(alpha, p, x);
            }

            axpy(alpha.faer_neg(), q, ar);
            ar_norm = norm2(ar);
            if !is_finite_real(ar_norm) {
                breakdown = true;
                break;
            }
            if zero_curvature || on_boundary {
                solved = true;
                break;
            }

            axpy(alpha.faer_neg(), ap, r);
            a.apply(s, ar, par);
            if let Some(pc) = precond {
                precondition(pc, mode, ms, s);
            }
            let ms_ref: &[E] = if precond.is_some() { &ms[..] } else { &s[..] };
            let mut gamma_next = dotr(s, ms_ref);
            if regularized {
                gamma_next = gamma_next.faer_add(lambda.faer_mul(ar_norm).faer_mul(ar_norm));
            }
            let beta = gamma_next.faer_div(gamma);

            xpby(ar, beta, p);
            xpby(s, beta, ap);
            match precond {
                Some(pc) => {
                    precondition(pc, mode, map, ap);
                    a.adjoint_apply(q, map, par);
                }
                None => a.adjoint_apply(q, ap, par),
            }
            if regularized {
                axpy(lambda, p, q);
            }
            gamma = gamma_next;

            r_norm = if regularized {
                norm2_squared(r)
                    .faer_add(lambda.faer_mul(norm2_squared(x)))
                    .faer_sqrt()
            } else {
                norm2(r)
            };
            if history {
                stats.residuals.push(r_norm);
                stats.aresiduals.push(ar_norm);
            }
            iter += 1;
            if let Some(rep) = reporter.as_mut() {
                rep.on_iteration(&IterationReport {
                    iteration: iter,
                    ar_norm,
                    r_norm,
                });
            }
            if let Some(callback) = options.callback {
                user_exit = callback(&SolverState {
                    iteration: iter,
                    x: &x[..],
                    r: &r[..],
                    ar: &ar[..],
                    ar_norm,
                    r_norm,
                });
            }
            solved = ar_norm <= eps || on_boundary;
            tired = iter >= itmax;
        }

        if breakdown {
            solved = false;
        }
        stats.status = if breakdown {
            SolveStatus::Breakdown
        } else if user_exit {
            SolveStatus::UserExit
        } else if on_boundary {
            SolveStatus::OnTrustRegionBoundary
        } else if zero_curvature {
            SolveStatus::ZeroCurvature
        } else if solved {
            SolveStatus::Converged
        } else {
            SolveStatus::MaxIterations
        };
        stats.niter = iter;
        stats.solved = solved;
        stats.inconsistent = false;
        log::debug!(
            "crls finished after {iter} iterations: {} (‖Aᴴr‖ = {ar_norm:e})",
            stats.status
        );

        finish(stats, start_time, &mut reporter);
        Ok(&*stats)
    }
}

/// Solve min ‖Ax − b‖² + λ‖x‖² with a freshly allocated workspace.
///
/// Returns the solution (length `a.ncols()`) and the diagnostics.
pub fn solve<E, A>(
    a: &A,
    b: &[E],
    options: &SolverOptions<'_, E>,
) -> Result<(Vec<E>, SolverStats<E::Real>), SolveError>
where
    E: ComplexField,
    E::Real: fmt::LowerExp,
    A: LinearOperator<E> + ?Sized,
{
    let mut solver = CrlsSolver::new(a.nrows(), a.ncols(), Parallelism::None);
    solver.solve_inplace(a, b, options, None)?;
    Ok(solver.into_parts())
}

fn finish<R: fmt::LowerExp>(
    stats: &SolverStats<R>,
    start_time: Option<Instant>,
    reporter: &mut ReporterSlot<'_, R>,
) {
    if let Some(reporter) = reporter.as_mut() {
        reporter.on_finish(stats);
    }
    let Some(start) = start_time else {
        return;
    };
    let secs = start.elapsed().as_secs_f64();
    let (value, unit) = match secs {
        s if s >= 1.0 => (s, "s"),
        s if s >= 1e-3 => (s * 1e3, "ms"),
        s => (s * 1e6, "us"),
    };
    emit_line(&format!("time: {value:.3} {unit} ({} iterations)", stats.niter));
}
