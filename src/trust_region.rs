use faer_core::{ComplexField, RealField};

use crate::vector::{dotr, norm2_squared};

/// Ball constraint `‖x‖ ≤ radius` on the iterate.
///
/// A radius of zero disables the constraint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrustRegion<R: RealField> {
    radius: R,
}

impl<R: RealField> TrustRegion<R> {
    pub fn new(radius: R) -> Self {
        Self { radius }
    }

    pub fn radius(&self) -> R {
        self.radius
    }

    pub fn is_active(&self) -> bool {
        self.radius > R::faer_zero()
    }

    /// Largest `α ≥ 0` with `‖x + α d‖ = radius`.
    ///
    /// `d_norm2` is `‖d‖²`, passed in because the caller already has it.
    /// Returns zero when `x` sits on the boundary and `d` points outward, and
    /// `+∞` along a zero direction.
    pub fn step_to_boundary<E: ComplexField<Real = R>>(&self, x: &[E], d: &[E], d_norm2: R) -> R {
        let zero = R::faer_zero();
        if !(d_norm2 > zero) {
            return R::faer_one().faer_div(zero);
        }

        // ‖d‖² α² + 2 Re⟨x, d⟩ α + (‖x‖² − Δ²) = 0
        let two = R::faer_from_f64(2.0);
        let a = d_norm2;
        let b = two.faer_mul(dotr(x, d));
        let c = norm2_squared(x).faer_sub(self.radius.faer_mul(self.radius));

        let mut disc = b.faer_mul(b).faer_sub(R::faer_from_f64(4.0).faer_mul(a).faer_mul(c));
        if disc < zero {
            disc = zero;
        }
        let sqrt_disc = disc.faer_sqrt();

        // t = -(b + sign(b) √disc) / 2 avoids cancellation; the roots are t/a and c/t.
        let t = if b < zero {
            sqrt_disc.faer_sub(b).faer_div(two)
        } else {
            b.faer_add(sqrt_disc).faer_neg().faer_div(two)
        };
        if t == zero {
            return zero;
        }
        let r1 = t.faer_div(a);
        let r2 = c.faer_div(t);
        let root = if r1 > r2 { r1 } else { r2 };
        if root > zero {
            root
        } else {
            zero
        }
    }
}
