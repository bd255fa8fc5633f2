use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

use crls_rs::{
    solve, CrlsSolver, CscOperator, DiagonalPreconditioner, LinearOperator, Preconditioner,
    PreconditionerMode, SolveError, SolveStatus, SolverOptions, SolverState, TableReporter,
};
use faer_core::{c64, Mat, Parallelism};

struct CountingAlloc;

thread_local! {
    static ALLOC_TOTAL: Cell<usize> = const { Cell::new(0) };
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

fn record(size: usize) {
    let _ = ALLOC_TOTAL.try_with(|total| total.set(total.get() + size));
}

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            record(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            record(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe {
            System.dealloc(ptr, layout);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = unsafe { System.realloc(ptr, layout, new_size) };
        if !new_ptr.is_null() {
            record(new_size);
        }
        new_ptr
    }
}

fn reset_alloc_counter() {
    ALLOC_TOTAL.with(|total| total.set(0));
}

fn allocated_bytes() -> usize {
    ALLOC_TOTAL.with(|total| total.get())
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn residual(a: &Mat<f64>, x: &[f64], b: &[f64]) -> Vec<f64> {
    let mut ax = vec![0.0; b.len()];
    a.apply(&mut ax, x, Parallelism::None);
    b.iter().zip(&ax).map(|(bi, axi)| bi - axi).collect()
}

/// 4x2 full column rank matrix.
fn tall_4x2() -> Mat<f64> {
    Mat::from_fn(4, 2, |i, j| (2 * i + j + 1) as f64)
}

/// 8x5 well-conditioned matrix with an inconsistent right-hand side.
fn tall_8x5() -> (Mat<f64>, Vec<f64>) {
    let a = Mat::from_fn(8, 5, |i, j| {
        let diag = if i == j { 3.0 } else { 0.0 };
        diag + 1.0 / (1 + i + j) as f64
    });
    let b = (0..8).map(|i| ((i * 7 + 3) % 5) as f64 - 1.5).collect();
    (a, b)
}

/// 4x3 matrix whose third column is the sum of the first two.
fn rank_deficient() -> (Mat<f64>, Vec<f64>) {
    let cols = [[1.0, 0.0, 1.0, 2.0], [0.0, 1.0, 1.0, -1.0]];
    let a = Mat::from_fn(4, 3, |i, j| match j {
        0 | 1 => cols[j][i],
        _ => cols[0][i] + cols[1][i],
    });
    (a, vec![1.0, 2.0, 3.0, 4.0])
}

/// Diagonal `M` taken as given, for singular or indefinite weights.
struct RawDiagonal(Vec<f64>);

impl Preconditioner<f64> for RawDiagonal {
    fn dim(&self) -> usize {
        self.0.len()
    }

    fn apply(&self, out: &mut [f64], rhs: &[f64]) {
        for ((o, v), d) in out.iter_mut().zip(rhs).zip(&self.0) {
            *o = v * d;
        }
    }

    fn solve(&self, out: &mut [f64], rhs: &[f64]) {
        for ((o, v), d) in out.iter_mut().zip(rhs).zip(&self.0) {
            *o = v / d;
        }
    }
}

fn to_csc(a: &Mat<f64>) -> CscOperator<f64> {
    let mut triplets = Vec::new();
    for j in 0..a.ncols() {
        for i in 0..a.nrows() {
            let v = a.read(i, j);
            if v != 0.0 {
                triplets.push((i, j, v));
            }
        }
    }
    CscOperator::from_triplets(a.nrows(), a.ncols(), &triplets).unwrap()
}

#[test]
fn zero_rhs_returns_zero_solution() {
    let a = tall_4x2();
    let options = SolverOptions {
        history: true,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &[0.0; 4], &options).unwrap();
    assert_eq!(x, vec![0.0, 0.0]);
    assert_eq!(stats.niter, 0);
    assert!(stats.solved);
    assert!(!stats.inconsistent);
    assert_eq!(stats.status, SolveStatus::ZeroResidual);
    assert_eq!(stats.status.to_string(), "x = 0 is a zero-residual solution");
    assert_eq!(stats.aresiduals, vec![0.0]);
    assert!(stats.residuals.is_empty());
}

#[test]
fn consistent_tall_system() {
    let a = tall_4x2();
    let x_true = [1.0, -1.0];
    let mut b = vec![0.0; 4];
    a.apply(&mut b, &x_true, Parallelism::None);

    let (x, stats) = solve(&a, &b, &SolverOptions::default()).unwrap();
    assert!(stats.solved);
    assert_eq!(stats.status, SolveStatus::Converged);
    assert_eq!(stats.status.to_string(), "solution good enough given atol and rtol");
    assert!(stats.niter <= 6, "niter = {}", stats.niter);
    let rel = norm(&residual(&a, &x, &b)) / norm(&b);
    assert!(rel <= 1e-6, "relative residual {rel}");
}

#[test]
fn histories_are_monotone() {
    let (a, b) = tall_8x5();
    let options = SolverOptions {
        history: true,
        ..SolverOptions::default()
    };
    let (_, stats) = solve(&a, &b, &options).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    assert_eq!(stats.residuals.len(), stats.niter + 1);
    assert_eq!(stats.aresiduals.len(), stats.niter + 1);
    for w in stats.aresiduals.windows(2) {
        assert!(w[1] <= w[0] * (1.0 + 1e-10), "‖Aᴴr‖ increased: {w:?}");
    }
    for w in stats.residuals.windows(2) {
        assert!(w[1] <= w[0] * (1.0 + 1e-10), "‖r‖ increased: {w:?}");
    }
}

#[test]
fn tolerance_is_actually_met() {
    let (a, b) = tall_8x5();
    let options = SolverOptions {
        history: true,
        atol: 1e-10,
        rtol: 1e-6,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &b, &options).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    let initial = stats.aresiduals[0];
    let last = *stats.aresiduals.last().unwrap();
    assert!(last <= options.atol + options.rtol * initial);

    // Least-squares optimality: the true gradient is small as well.
    let r = residual(&a, &x, &b);
    let mut g = vec![0.0; 5];
    a.adjoint_apply(&mut g, &r, Parallelism::None);
    assert!(norm(&g) <= 1e-5 * initial);
}

#[test]
fn trust_region_boundary() {
    let a = tall_4x2();
    let mut b = vec![0.0; 4];
    a.apply(&mut b, &[1.0, -1.0], Parallelism::None);
    let calls = Cell::new(0);
    let callback = |_: &SolverState<'_, f64>| {
        calls.set(calls.get() + 1);
        false
    };
    let options = SolverOptions::<f64> {
        radius: 0.5,
        history: true,
        callback: Some(&callback),
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &b, &options).unwrap();
    assert_eq!(stats.status, SolveStatus::OnTrustRegionBoundary);
    assert_eq!(stats.status.to_string(), "on trust-region boundary");
    assert!(stats.solved);
    assert!((norm(&x) - 0.5).abs() <= 1e-10, "‖x‖ = {}", norm(&x));

    // The clipped step is not counted: one full iteration, then the boundary.
    assert_eq!(stats.niter, 1);
    assert_eq!(stats.residuals.len(), 2);
    assert_eq!(stats.aresiduals.len(), 2);
    assert_eq!(calls.get(), 1);
}

#[test]
fn rank_deficient_with_radius() {
    let (a, b) = rank_deficient();
    for radius in [0.1, 0.5] {
        let options = SolverOptions {
            radius,
            ..SolverOptions::default()
        };
        let (x, stats) = solve(&a, &b, &options).unwrap();
        assert!(
            matches!(
                stats.status,
                SolveStatus::ZeroCurvature | SolveStatus::OnTrustRegionBoundary
            ),
            "unexpected status: {:?}",
            stats.status
        );
        assert!(stats.solved);
        assert!(x.iter().all(|v| v.is_finite()));
        assert!(norm(&x) <= radius * (1.0 + 1e-10));
    }
}

#[test]
fn zero_curvature_takes_gradient_step() {
    // Along p the curvature ‖Ap‖² is below ε ‖q‖ ‖p‖, so the solver steps along
    // Aᴴr to the minimizer of the quadratic.
    let a = Mat::<f64>::from_fn(1, 1, |_, _| 1e-3);
    let options = SolverOptions {
        atol: 2.0,
        rtol: 0.0,
        radius: 1e9,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &[1e4], &options).unwrap();
    assert_eq!(stats.status, SolveStatus::ZeroCurvature);
    assert_eq!(stats.status.to_string(), "zero-curvature encountered");
    assert!(stats.solved);
    assert_eq!(stats.niter, 0);
    assert!((x[0] / 1e7 - 1.0).abs() < 1e-10, "x = {}", x[0]);
}

#[test]
fn zero_curvature_step_with_ridge() {
    // The gradient step lands on the regularized minimizer a b / (a² + λ) = 5e6.
    let a = Mat::<f64>::from_fn(1, 1, |_, _| 1e-3);
    let options = SolverOptions {
        lambda: 1e-6,
        atol: 2.0,
        rtol: 0.0,
        radius: 1e9,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &[1e4], &options).unwrap();
    assert_eq!(stats.status, SolveStatus::ZeroCurvature);
    assert_eq!(stats.niter, 0);
    assert!((x[0] / 5e6 - 1.0).abs() < 1e-10, "x = {}", x[0]);
}

#[test]
fn zero_curvature_step_with_preconditioner() {
    let a = Mat::from_fn(1, 1, |_, _| 1e-3);
    let m = DiagonalPreconditioner::<f64>::new(vec![4.0]).unwrap();
    let options = SolverOptions::<f64> {
        preconditioner: Some(&m),
        atol: 2.0,
        rtol: 0.0,
        radius: 1e9,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &[1e4], &options).unwrap();
    assert_eq!(stats.status, SolveStatus::ZeroCurvature);
    assert_eq!(stats.niter, 0);
    assert!((x[0] / 1e7 - 1.0).abs() < 1e-10, "x = {}", x[0]);
}

#[test]
fn indefinite_preconditioner_without_radius() {
    // M = diag(1, -1) makes γ = ⟨s, Ms⟩ = 0 and q = Aᴴ M s = 0 on the first step.
    let a = Mat::from_fn(2, 1, |_, _| 1.0);
    let m = RawDiagonal(vec![1.0, -1.0]);
    let options = SolverOptions::<f64> {
        preconditioner: Some(&m),
        history: true,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &[0.0, 1.0], &options).unwrap();
    assert_eq!(stats.status, SolveStatus::ZeroCurvature);
    assert!(stats.solved);
    assert_eq!(stats.niter, 0);
    assert_eq!(stats.aresiduals, vec![1.0]);
    assert_eq!(x, vec![0.0]);
}

#[test]
fn singular_preconditioner_is_a_breakdown() {
    let a = Mat::from_fn(3, 2, |i, j| (i + 1 + 2 * j) as f64);
    let b = [1.0, 2.0, 3.0];
    assert!(DiagonalPreconditioner::<f64>::new(vec![1.0, 0.0, 1.0]).is_err());

    // M⁻¹ r is infinite, which must not pass the ‖Aᴴr‖ ≤ atol + rtol ‖Aᴴr‖ test.
    let m = RawDiagonal(vec![1.0, 0.0, 1.0]);
    let options = SolverOptions::<f64> {
        preconditioner: Some(&m),
        preconditioner_mode: PreconditionerMode::Solve,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &b, &options).unwrap();
    assert_eq!(stats.status, SolveStatus::Breakdown);
    assert_eq!(stats.status.to_string(), "non-finite value encountered");
    assert!(!stats.solved);
    assert_eq!(stats.niter, 0);
    assert_eq!(x, vec![0.0, 0.0]);
}

#[test]
fn repeated_solves_are_bit_identical() {
    let (a, b) = tall_8x5();
    let options = SolverOptions {
        history: true,
        ..SolverOptions::default()
    };
    let mut solver = CrlsSolver::new(8, 5, Parallelism::None);
    let first_stats = solver.solve_inplace(&a, &b, &options, None).unwrap().clone();
    let first_x = solver.x().to_vec();

    // Dirty the workspace with a different problem in between.
    let other: Vec<f64> = b.iter().map(|v| v * 3.0 + 1.0).collect();
    solver.solve_inplace(&a, &other, &options, None).unwrap();

    let second_stats = solver.solve_inplace(&a, &b, &options, None).unwrap().clone();
    let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&first_x), bits(solver.x()));
    assert_eq!(first_stats, second_stats);
}

#[test]
fn ridge_regularization_matches_closed_form() {
    let a = Mat::<f64>::from_fn(3, 2, |i, j| match (i, j) {
        (0, 0) | (1, 1) | (2, _) => 1.0,
        _ => 0.0,
    });
    let b = [1.0, 2.0, 3.0];
    let options = SolverOptions {
        lambda: 0.5,
        history: true,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &b, &options).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    // (AᵀA + λI) x = Aᵀb with AᵀA = [[2, 1], [1, 2]], Aᵀb = [4, 5].
    assert!((x[0] - 5.0 / 5.25).abs() < 1e-6);
    assert!((x[1] - 8.5 / 5.25).abs() < 1e-6);

    let r = residual(&a, &x, &b);
    let expected = (norm(&r).powi(2) + 0.5 * norm(&x).powi(2)).sqrt();
    let reported = *stats.residuals.last().unwrap();
    assert!((reported - expected).abs() < 1e-8);
}

#[test]
fn complex_problem() {
    let a = Mat::from_fn(4, 2, |i, j| c64::new((i + 1) as f64, j as f64));
    let x_true = [c64::new(1.0, 1.0), c64::new(2.0, -1.0)];
    let mut b = vec![c64::new(0.0, 0.0); 4];
    a.apply(&mut b, &x_true, Parallelism::None);

    let (x, stats) = solve(&a, &b, &SolverOptions::default()).unwrap();
    assert_eq!(stats.status, SolveStatus::Converged);
    for (xi, ti) in x.iter().zip(&x_true) {
        assert!((xi.re - ti.re).abs() < 1e-6 && (xi.im - ti.im).abs() < 1e-6);
    }
}

#[test]
fn diagonal_preconditioner_in_both_modes() {
    let a = tall_4x2();
    let mut b = vec![0.0; 4];
    a.apply(&mut b, &[1.0, -1.0], Parallelism::None);
    let row_norms: Vec<f64> = (0..4)
        .map(|i| (0..2).map(|j| a.read(i, j).powi(2)).sum())
        .collect();

    let multiply = DiagonalPreconditioner::<f64>::inverse_row_norms(&row_norms).unwrap();
    let by_solve = DiagonalPreconditioner::<f64>::new(row_norms.clone()).unwrap();
    let cases = [
        (&multiply, PreconditionerMode::Multiply),
        (&by_solve, PreconditionerMode::Solve),
    ];
    for (m, mode) in cases {
        let options = SolverOptions::<f64> {
            preconditioner: Some(m),
            preconditioner_mode: mode,
            ..SolverOptions::default()
        };
        let (x, stats) = solve(&a, &b, &options).unwrap();
        assert_eq!(stats.status, SolveStatus::Converged, "{mode:?}");
        assert!((x[0] - 1.0).abs() < 1e-6 && (x[1] + 1.0).abs() < 1e-6, "{mode:?}: {x:?}");
    }
}

#[test]
fn callback_requests_exit() {
    let (a, b) = tall_8x5();
    let seen = Cell::new(0);
    let callback = |state: &SolverState<'_, f64>| {
        seen.set(state.iteration);
        assert_eq!(state.x.len(), 5);
        assert_eq!(state.r.len(), 8);
        state.iteration >= 2
    };
    let options = SolverOptions::<f64> {
        callback: Some(&callback),
        ..SolverOptions::default()
    };
    let (_, stats) = solve(&a, &b, &options).unwrap();
    assert_eq!(stats.status, SolveStatus::UserExit);
    assert_eq!(stats.status.to_string(), "user-requested exit");
    assert_eq!(stats.niter, 2);
    assert_eq!(seen.get(), 2);
}

#[test]
fn iteration_budget() {
    let (a, b) = tall_8x5();
    let options = SolverOptions {
        itmax: 1,
        ..SolverOptions::default()
    };
    let (x, stats) = solve(&a, &b, &options).unwrap();
    assert_eq!(stats.status, SolveStatus::MaxIterations);
    assert_eq!(stats.status.to_string(), "maximum number of iterations exceeded");
    assert!(!stats.solved);
    assert_eq!(stats.niter, 1);
    assert!(x.iter().all(|v| v.is_finite()));
}

#[test]
fn configuration_errors() {
    let a = tall_4x2();
    let mut solver = CrlsSolver::<f64>::new(4, 2, Parallelism::None);
    let options = SolverOptions::default();

    let err = solver
        .solve_inplace(&a, &[1.0; 3], &options, None)
        .unwrap_err();
    assert_eq!(err, SolveError::RhsLength { expected: 4, actual: 3 });

    let small = Mat::<f64>::from_fn(3, 2, |i, j| (i + j) as f64);
    let err = solver
        .solve_inplace(&small, &[1.0; 3], &options, None)
        .unwrap_err();
    assert_eq!(
        err,
        SolveError::OperatorShape {
            expected: (4, 2),
            actual: (3, 2)
        }
    );

    let m = DiagonalPreconditioner::<f64>::new(vec![1.0; 3]).unwrap();
    let options = SolverOptions::<f64> {
        preconditioner: Some(&m),
        ..SolverOptions::default()
    };
    let err = solver
        .solve_inplace(&a, &[1.0; 4], &options, None)
        .unwrap_err();
    assert_eq!(err, SolveError::PreconditionerDimension { expected: 4, actual: 3 });
    assert_eq!(solver.stats().status, SolveStatus::Unknown);
}

#[test]
fn sparse_and_dense_agree() {
    let (a, b) = tall_8x5();
    let csc = to_csc(&a);
    let (x_dense, dense_stats) = solve(&a, &b, &SolverOptions::default()).unwrap();
    let (x_sparse, sparse_stats) = solve(&csc, &b, &SolverOptions::default()).unwrap();
    assert_eq!(dense_stats.status, sparse_stats.status);
    for (d, s) in x_dense.iter().zip(&x_sparse) {
        assert!((d - s).abs() < 1e-10);
    }
}

#[test]
fn table_reporter_sees_every_iteration() {
    let (a, b) = tall_8x5();
    let mut solver = CrlsSolver::new(8, 5, Parallelism::None);
    let mut reporter = TableReporter::<f64>::new();
    let niter = solver
        .solve_inplace(&a, &b, &SolverOptions::default(), Some(&mut reporter))
        .unwrap()
        .niter;
    assert!(niter > 0);
    // Rows are drained once the table has been emitted.
    assert!(reporter.rows().is_empty());

    let options = SolverOptions {
        verbose: 2,
        ..SolverOptions::default()
    };
    let stats = solver.solve_inplace(&a, &b, &options, None).unwrap();
    assert_eq!(stats.niter, niter);
}

#[test]
fn allocations() {
    let (a, b) = tall_8x5();
    let csc = to_csc(&a);
    let row_norms = csc.row_norms_squared();
    let m = DiagonalPreconditioner::<f64>::inverse_row_norms(&row_norms).unwrap();
    let plain = SolverOptions::default();
    let preconditioned = SolverOptions::<f64> {
        preconditioner: Some(&m),
        ..SolverOptions::default()
    };

    let mut solver = CrlsSolver::new(8, 5, Parallelism::None);
    solver.solve_inplace(&csc, &b, &plain, None).unwrap();
    solver.solve_inplace(&csc, &b, &preconditioned, None).unwrap();

    reset_alloc_counter();
    for _ in 0..3 {
        solver.solve_inplace(&csc, &b, &plain, None).unwrap();
        solver.solve_inplace(&csc, &b, &preconditioned, None).unwrap();
    }
    let alloc = allocated_bytes();
    assert_eq!(alloc, 0, "steady-state solves allocated {alloc} bytes");
}
