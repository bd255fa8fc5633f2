//! Level-1 kernels over plain slices.
//!
//! Inner products use the conjugate-symmetric form `⟨x, y⟩ = Σ conj(xᵢ) yᵢ`,
//! so squared norms are real and non-negative for complex fields.

use faer_core::{ComplexField, RealField};

/// Conjugate-symmetric inner product `⟨x, y⟩`.
pub(crate) fn dot<E: ComplexField>(x: &[E], y: &[E]) -> E {
    debug_assert_eq!(x.len(), y.len());
    let mut sum = E::faer_zero();
    for (a, b) in x.iter().zip(y.iter()) {
        sum = sum.faer_add(a.faer_conj().faer_mul(*b));
    }
    sum
}

/// Real part of `⟨x, y⟩`.
pub(crate) fn dotr<E: ComplexField>(x: &[E], y: &[E]) -> E::Real {
    dot(x, y).faer_real()
}

pub(crate) fn norm2_squared<E: ComplexField>(x: &[E]) -> E::Real {
    let mut sum = E::Real::faer_zero();
    for v in x {
        sum = sum.faer_add(v.faer_abs2());
    }
    sum
}

pub(crate) fn norm2<E: ComplexField>(x: &[E]) -> E::Real {
    norm2_squared(x).faer_sqrt()
}

/// `y ← y + alpha * x`.
pub(crate) fn axpy<E: ComplexField>(alpha: E::Real, x: &[E], y: &mut [E]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, xi) in y.iter_mut().zip(x.iter()) {
        *yi = yi.faer_add(xi.faer_scale_real(alpha));
    }
}

/// `y ← x + beta * y`.
pub(crate) fn xpby<E: ComplexField>(x: &[E], beta: E::Real, y: &mut [E]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, xi) in y.iter_mut().zip(x.iter()) {
        *yi = xi.faer_add(yi.faer_scale_real(beta));
    }
}

pub(crate) fn fill_zero<E: ComplexField>(x: &mut [E]) {
    x.fill(E::faer_zero());
}

pub(crate) fn is_finite_real<R: RealField>(value: R) -> bool {
    value.faer_is_finite()
}
