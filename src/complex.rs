//! Complex vector helpers shared by the recursion and the gain network.

use nalgebra::DVector;
use num_complex::Complex32;

pub type CVector = DVector<Complex32>;

pub const ZERO: Complex32 = Complex32::new(0.0, 0.0);

/// Bilinear dot product `Σ a[i] * b[i]`, without conjugating either side.
///
/// The filter's prediction and echo estimate both use this form; switching to
/// the sesquilinear product changes how the taps converge.
#[inline]
pub fn dot(a: &CVector, b: &CVector) -> Complex32 {
    a.dot(b)
}

/// Splits a complex vector into its real and imaginary parts.
pub fn split(v: &CVector) -> (DVector<f32>, DVector<f32>) {
    (v.map(|c| c.re), v.map(|c| c.im))
}

/// Builds a complex vector from separate real and imaginary parts.
pub fn combine(re: &DVector<f32>, im: &DVector<f32>) -> CVector {
    re.zip_map(im, Complex32::new)
}

/// Mean of `|v[i]|`; zero for an empty vector.
pub fn mean_magnitude(v: &CVector) -> f32 {
    if v.is_empty() {
        return 0.0;
    }
    v.iter().map(|c| c.norm()).sum::<f32>() / v.len() as f32
}
