use core::fmt;

use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};

/// Terminal state of a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    /// No solve has run on this workspace yet.
    Unknown,
    /// `b = 0`, so `x = 0` solves the problem exactly.
    ZeroResidual,
    /// `‖Aᴴr‖ ≤ atol + rtol ‖Aᴴb‖`.
    Converged,
    /// The normal-equations operator has no curvature along the search direction.
    ZeroCurvature,
    /// The step was clipped to the trust-region boundary.
    OnTrustRegionBoundary,
    /// The iteration budget ran out.
    MaxIterations,
    /// The callback asked to stop.
    UserExit,
    /// `‖Aᴴr‖`, `γ` or `‖q‖` became infinite or NaN; the iterate is not a solution.
    Breakdown,
}

impl SolveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::ZeroResidual => "x = 0 is a zero-residual solution",
            Self::Converged => "solution good enough given atol and rtol",
            Self::ZeroCurvature => "zero-curvature encountered",
            Self::OnTrustRegionBoundary => "on trust-region boundary",
            Self::MaxIterations => "maximum number of iterations exceeded",
            Self::UserExit => "user-requested exit",
            Self::Breakdown => "non-finite value encountered",
        }
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostics of the last solve.
///
/// `residuals` holds `‖r_k‖` and `aresiduals` holds `‖Aᴴr_k‖`; both stay empty
/// unless history recording was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverStats<R> {
    pub niter: usize,
    pub solved: bool,
    /// The problem was proven to have no exact solution. CRLS never sets it.
    pub inconsistent: bool,
    pub status: SolveStatus,
    pub residuals: Vec<R>,
    pub aresiduals: Vec<R>,
}

impl<R> SolverStats<R> {
    pub(crate) fn new() -> Self {
        Self {
            niter: 0,
            solved: false,
            inconsistent: false,
            status: SolveStatus::Unknown,
            residuals: Vec::new(),
            aresiduals: Vec::new(),
        }
    }

    /// Clears the record while keeping history capacity for reuse.
    pub(crate) fn reset(&mut self) {
        self.niter = 0;
        self.solved = false;
        self.inconsistent = false;
        self.status = SolveStatus::Unknown;
        self.residuals.clear();
        self.aresiduals.clear();
    }
}

/// One row of iteration output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport<R> {
    pub iteration: usize,
    /// `‖Aᴴr‖`.
    pub ar_norm: R,
    /// `‖r‖`, including the `λ‖x‖²` term when regularized.
    pub r_norm: R,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

/// Receives per-iteration diagnostics during a solve.
pub trait Reporter<R> {
    fn on_iteration(&mut self, report: &IterationReport<R>);
    fn on_finish(&mut self, _stats: &SolverStats<R>) {}
}

/// Prints one line every `every` iterations as the solve progresses.
pub struct StdoutReporter {
    every: usize,
    header_done: bool,
}

impl StdoutReporter {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            header_done: false,
        }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<R: fmt::LowerExp> Reporter<R> for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport<R>) {
        if !self.header_done {
            emit_line(&format!("{:>5}  {:>8}  {:>8}", "k", "‖Aᴴr‖", "‖r‖"));
            self.header_done = true;
        }
        if report.iteration % self.every == 0 {
            emit_line(&format!(
                "{:>5}  {:>8.2e}  {:>8.2e}",
                report.iteration, report.ar_norm, report.r_norm
            ));
        }
    }

    fn on_finish(&mut self, stats: &SolverStats<R>) {
        emit_line(&format!("status: {}", stats.status));
        self.header_done = false;
    }
}

/// Collects every iteration and renders a table when the solve ends.
pub struct TableReporter<R> {
    rows: Vec<IterationReport<R>>,
}

impl<R> TableReporter<R> {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn rows(&self) -> &[IterationReport<R>] {
        &self.rows
    }
}

impl<R> Default for TableReporter<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: fmt::LowerExp + Copy> Reporter<R> for TableReporter<R> {
    fn on_iteration(&mut self, report: &IterationReport<R>) {
        self.rows.push(*report);
    }

    fn on_finish(&mut self, stats: &SolverStats<R>) {
        if self.rows.is_empty() {
            return;
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("k").set_alignment(CellAlignment::Right),
            Cell::new("‖Aᴴr‖").set_alignment(CellAlignment::Right),
            Cell::new("‖r‖").set_alignment(CellAlignment::Right),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.ar_norm)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.4e}", row.r_norm)).set_alignment(CellAlignment::Right),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        emit_line(&format!("status: {}", stats.status));
        self.rows.clear();
    }
}
