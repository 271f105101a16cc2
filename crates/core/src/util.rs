//! Small vector helpers on plain `[f64; 3]` arrays shared across solvers.

#[inline(always)]
pub fn sub(a: &[f64; 3], b: &[f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

#[inline(always)]
pub fn dot(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

#[inline(always)]
pub fn norm2(a: &[f64; 3]) -> f64 {
    dot(a, a)
}

#[inline(always)]
pub fn norm(a: &[f64; 3]) -> f64 {
    norm2(a).sqrt()
}

#[inline(always)]
pub fn scale(a: &[f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

/// `target += s * a`
#[inline(always)]
pub fn add_scaled(target: &mut [f64; 3], a: &[f64; 3], s: f64) {
    target[0] += s * a[0];
    target[1] += s * a[1];
    target[2] += s * a[2];
}

/// Convert masses to inverse masses. Zero mass maps to zero inverse mass,
/// which makes the atom immovable for the solvers.
pub fn inverse_masses(masses: &[f64]) -> Vec<f64> {
    masses
        .iter()
        .map(|&m| if m > 0.0 { 1.0 / m } else { 0.0 })
        .collect()
}
