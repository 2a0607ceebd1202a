use elliptic_curve::ff::Field;
use rand_core::CryptoRngCore;

/// Represents a polynomial with coefficients in a scalar field.
#[derive(Debug, Clone)]
pub struct Polynomial<F: Field> {
    /// The coefficients of our polynomial, from 0..size-1.
    coefficients: Vec<F>,
}

impl<F: Field> Polynomial<F> {
    /// Extend a constant to a random polynomial of a certain size.
    ///
    /// This is useful if you want the polynomial to have a certain value, but
    /// otherwise be random.
    pub fn extend_random(rng: &mut impl CryptoRngCore, size: usize, constant: &F) -> Self {
        let mut coefficients = Vec::with_capacity(size);
        coefficients.push(*constant);
        for _ in 1..size {
            coefficients.push(F::random(&mut *rng));
        }
        Self { coefficients }
    }

    /// Evaluate the polynomial at a point, using Horner's method.
    pub fn evaluate(&self, x: &F) -> F {
        let mut out = F::ZERO;
        for c in self.coefficients.iter().rev() {
            out = out * x + c;
        }
        out
    }
}
