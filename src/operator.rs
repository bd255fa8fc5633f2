use core::fmt;

use faer_core::mul::{matmul, matmul_with_conj};
use faer_core::{mat, ComplexField, Conj, Mat, MatRef, Parallelism, RealField, SimpleEntity};

/// Linear operator `A: Eⁿ → Eᵐ` together with its adjoint.
///
/// The solver only ever touches `A` through these two products, so any
/// representation (dense, sparse, implicit) can be plugged in.
pub trait LinearOperator<E: ComplexField> {
    /// Output dimension `m`.
    fn nrows(&self) -> usize;
    /// Input dimension `n`.
    fn ncols(&self) -> usize;

    /// Writes `A * rhs` into `out` (`rhs.len() == n`, `out.len() == m`).
    fn apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism);

    /// Writes `Aᴴ * rhs` into `out` (`rhs.len() == m`, `out.len() == n`).
    fn adjoint_apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism);
}

impl<E: ComplexField, T: LinearOperator<E> + ?Sized> LinearOperator<E> for &T {
    #[inline]
    fn nrows(&self) -> usize {
        (**self).nrows()
    }

    #[inline]
    fn ncols(&self) -> usize {
        (**self).ncols()
    }

    #[inline]
    fn apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism) {
        (**self).apply(out, rhs, parallelism)
    }

    #[inline]
    fn adjoint_apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism) {
        (**self).adjoint_apply(out, rhs, parallelism)
    }
}

impl<E: ComplexField + SimpleEntity> LinearOperator<E> for MatRef<'_, E> {
    #[inline]
    fn nrows(&self) -> usize {
        MatRef::nrows(self)
    }

    #[inline]
    fn ncols(&self) -> usize {
        MatRef::ncols(self)
    }

    fn apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism) {
        let rhs = mat::from_column_major_slice::<E>(rhs, self.ncols(), 1);
        let out = mat::from_column_major_slice_mut::<E>(out, self.nrows(), 1);
        matmul(
            out,
            *self,
            rhs,
            None,
            E::faer_one(),
            parallelism,
        );
    }

    fn adjoint_apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism) {
        let rhs = mat::from_column_major_slice::<E>(rhs, self.nrows(), 1);
        let out = mat::from_column_major_slice_mut::<E>(out, self.ncols(), 1);
        matmul_with_conj(
            out,
            self.transpose(),
            Conj::Yes,
            rhs,
            Conj::No,
            None,
            E::faer_one(),
            parallelism,
        );
    }
}

impl<E: ComplexField + SimpleEntity> LinearOperator<E> for Mat<E> {
    #[inline]
    fn nrows(&self) -> usize {
        Mat::nrows(self)
    }

    #[inline]
    fn ncols(&self) -> usize {
        Mat::ncols(self)
    }

    fn apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism) {
        self.as_ref().apply(out, rhs, parallelism)
    }

    fn adjoint_apply(&self, out: &mut [E], rhs: &[E], parallelism: Parallelism) {
        self.as_ref().adjoint_apply(out, rhs, parallelism)
    }
}

/// Which action of `M` the solver uses when preconditioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreconditionerMode {
    /// Residual-space vectors are multiplied by `M`.
    #[default]
    Multiply,
    /// Residual-space vectors are mapped through `M⁻¹`.
    Solve,
}

/// Hermitian positive definite preconditioner over the residual space.
///
/// The solver calls exactly one of `apply` or `solve`, chosen once per call
/// through [`PreconditionerMode`].
pub trait Preconditioner<E: ComplexField> {
    /// Dimension of the residual space `M` acts on.
    fn dim(&self) -> usize;

    /// Writes `M * rhs` into `out`.
    fn apply(&self, out: &mut [E], rhs: &[E]);

    /// Writes `M⁻¹ * rhs` into `out`.
    fn solve(&self, out: &mut [E], rhs: &[E]);
}

impl<E: ComplexField, T: Preconditioner<E> + ?Sized> Preconditioner<E> for &T {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn apply(&self, out: &mut [E], rhs: &[E]) {
        (**self).apply(out, rhs)
    }

    fn solve(&self, out: &mut [E], rhs: &[E]) {
        (**self).solve(out, rhs)
    }
}

/// Applies `M` to `rhs` in the requested mode.
#[inline]
pub(crate) fn precondition<E: ComplexField>(
    m: &dyn Preconditioner<E>,
    mode: PreconditionerMode,
    out: &mut [E],
    rhs: &[E],
) {
    match mode {
        PreconditionerMode::Multiply => m.apply(out, rhs),
        PreconditionerMode::Solve => m.solve(out, rhs),
    }
}

/// Errors while building a [`DiagonalPreconditioner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionerError {
    /// A diagonal entry is zero, negative, infinite or NaN.
    NonPositiveEntry { index: usize },
    /// A squared row norm is negative, infinite or NaN.
    InvalidRowNorm { index: usize },
}

impl fmt::Display for PreconditionerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveEntry { index } => {
                write!(f, "diagonal entry {index} must be finite and positive")
            }
            Self::InvalidRowNorm { index } => {
                write!(f, "squared row norm {index} must be finite and non-negative")
            }
        }
    }
}

impl std::error::Error for PreconditionerError {}

/// Diagonal preconditioner `M = diag(d)` with real positive entries.
#[derive(Debug, Clone)]
pub struct DiagonalPreconditioner<E: ComplexField> {
    diag: Vec<E::Real>,
}

impl<E: ComplexField> DiagonalPreconditioner<E> {
    /// Every entry of `diag` must be finite and strictly positive.
    pub fn new(diag: Vec<E::Real>) -> Result<Self, PreconditionerError> {
        let zero = E::Real::faer_zero();
        if let Some(index) = diag
            .iter()
            .position(|&d| !(d.faer_is_finite() && d > zero))
        {
            return Err(PreconditionerError::NonPositiveEntry { index });
        }
        Ok(Self { diag })
    }

    /// Builds `M = diag(1 / ‖row_i(A)‖²)` from the squared row norms of `A`.
    ///
    /// Rows with zero norm get a unit weight.
    pub fn inverse_row_norms(row_norms_squared: &[E::Real]) -> Result<Self, PreconditionerError> {
        let zero = E::Real::faer_zero();
        let one = E::Real::faer_one();
        let mut diag = Vec::with_capacity(row_norms_squared.len());
        for (index, &w) in row_norms_squared.iter().enumerate() {
            if !(w.faer_is_finite() && w >= zero) {
                return Err(PreconditionerError::InvalidRowNorm { index });
            }
            diag.push(if w > zero { one.faer_div(w) } else { one });
        }
        Self::new(diag)
    }

    pub fn diagonal(&self) -> &[E::Real] {
        &self.diag
    }
}

impl<E: ComplexField> Preconditioner<E> for DiagonalPreconditioner<E> {
    fn dim(&self) -> usize {
        self.diag.len()
    }

    fn apply(&self, out: &mut [E], rhs: &[E]) {
        for ((o, &v), &d) in out.iter_mut().zip(rhs).zip(&self.diag) {
            *o = v.faer_scale_real(d);
        }
    }

    fn solve(&self, out: &mut [E], rhs: &[E]) {
        for ((o, &v), &d) in out.iter_mut().zip(rhs).zip(&self.diag) {
            *o = v.faer_scale_real(d.faer_inv());
        }
    }
}
