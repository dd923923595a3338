use crate::{
    floating_type_mod::{FT, PI},
    V2,
};

/// Gradients of particles closer than `COINCIDENT_EPS * h` are treated as zero.
pub const COINCIDENT_EPS: FT = 1.0e-6;

pub fn poly6_coefficient(h: FT) -> FT {
    315. / (64. * PI * h.powi(9))
}

pub fn spiky_gradient_coefficient(h: FT) -> FT {
    -45. / (PI * h.powi(6))
}

pub fn viscosity_laplacian_coefficient(h: FT) -> FT {
    45. / (PI * h.powi(6))
}

/**
 * W_poly6(r, h) = 315 / (64 pi h^9) * (h^2 - r^2)^3 for r <= h.
 * Takes the squared distance.
 */
pub fn poly6(r_sq: FT, h: FT) -> FT {
    poly6_with_coeff(r_sq, h * h, poly6_coefficient(h))
}

#[inline(always)]
pub fn poly6_with_coeff(r_sq: FT, h_sq: FT, coeff: FT) -> FT {
    if r_sq > h_sq {
        return 0.;
    }
    let diff = h_sq - r_sq;
    coeff * diff * diff * diff
}

/**
 * W_spiky(r, h) = 15 / (pi h^6) * (h - r)^3 for r <= h.
 * Only used to check the gradient below.
 */
pub fn spiky(r: FT, h: FT) -> FT {
    if r > h {
        return 0.;
    }
    let v = h - r;
    15. / (PI * h.powi(6)) * v * v * v
}

/**
 * Gradient of the spiky kernel with respect to x_i where diff = x_i - x_j.
 */
pub fn spiky_gradient(diff: V2, h: FT) -> V2 {
    spiky_gradient_with_coeff(diff, h, spiky_gradient_coefficient(h))
}

#[inline(always)]
pub fn spiky_gradient_with_coeff(diff: V2, h: FT, coeff: FT) -> V2 {
    let r = diff.norm();
    if r > h || r <= COINCIDENT_EPS * h {
        return V2::zeros();
    }
    let v = h - r;
    diff * (coeff * v * v / r)
}

/**
 * Laplacian of the viscosity kernel, 45 / (pi h^6) * (h - r) for r <= h.
 */
pub fn viscosity_laplacian(r: FT, h: FT) -> FT {
    viscosity_laplacian_with_coeff(r, h, viscosity_laplacian_coefficient(h))
}

#[inline(always)]
pub fn viscosity_laplacian_with_coeff(r: FT, h: FT, coeff: FT) -> FT {
    if r > h {
        return 0.;
    }
    coeff * (h - r)
}

/// Coefficients shared by the density and force programs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KernelCoefficients {
    pub h: FT,
    pub h_sq: FT,
    pub poly6: FT,
    pub spiky_gradient: FT,
    pub viscosity_laplacian: FT,
}

impl KernelCoefficients {
    pub fn new(h: FT) -> KernelCoefficients {
        KernelCoefficients {
            h,
            h_sq: h * h,
            poly6: poly6_coefficient(h),
            spiky_gradient: spiky_gradient_coefficient(h),
            viscosity_laplacian: viscosity_laplacian_coefficient(h),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.h_sq.is_finite()
            && self.poly6.is_finite()
            && self.spiky_gradient.is_finite()
            && self.viscosity_laplacian.is_finite()
    }

    /// Weight of a particle on itself.
    pub fn poly6_self(&self) -> FT {
        self.poly6 * self.h_sq * self.h_sq * self.h_sq
    }
}

#[test]
fn kernels_vanish_outside_support() {
    let h = 0.02;
    assert_eq!(poly6(h * h * 1.01, h), 0.);
    assert_eq!(spiky_gradient(V2::new(h * 1.01, 0.), h), V2::zeros());
    assert_eq!(viscosity_laplacian(h * 1.01, h), 0.);

    // continuous at the border
    assert!(poly6(h * h, h).abs() < 1e-6);
    assert!(spiky_gradient(V2::new(h, 0.), h).norm() < 1e-6);
    assert!(viscosity_laplacian(h, h).abs() < 1e-6);
}

#[test]
fn poly6_is_largest_at_center() {
    let h = 0.02;
    let mut last = poly6(0., h);
    assert!(last > 0.);
    crate::assert_ft_approx_eq(last, KernelCoefficients::new(h).poly6_self(), last * 1e-5, || {
        String::from("poly6(0)")
    });
    for k in 1..=20 {
        let r = h * k as FT / 20.;
        let w = poly6(r * r, h);
        assert!(w <= last);
        last = w;
    }
}

#[test]
fn viscosity_laplacian_is_non_negative() {
    let h = 0.02;
    for k in 0..=40 {
        let r = h * k as FT / 20.;
        assert!(viscosity_laplacian(r, h) >= 0.);
    }
}

#[test]
fn spiky_gradient_matches_finite_difference() {
    let h = 1.;
    let test_grid_size = 40;
    let diff = h * 1e-3;
    let diff_half = diff * 0.5;
    let sample_offset = 2. * h / test_grid_size as FT;

    for y in 0..test_grid_size {
        for x in 0..test_grid_size {
            let sample_point = V2::new(
                (x as FT + 0.5) * sample_offset - h,
                (y as FT + 0.5) * sample_offset - h,
            );
            // the derivative has a kink at the border of the support
            let r = sample_point.norm();
            if r > 0.95 * h || r < 0.05 * h {
                continue;
            }

            let analytical = spiky_gradient(sample_point, h);

            let x_neg = spiky((sample_point + V2::new(-diff_half, 0.)).norm(), h);
            let x_pos = spiky((sample_point + V2::new(diff_half, 0.)).norm(), h);
            let y_neg = spiky((sample_point + V2::new(0., -diff_half)).norm(), h);
            let y_pos = spiky((sample_point + V2::new(0., diff_half)).norm(), h);
            let approx = V2::new((x_pos - x_neg) / diff, (y_pos - y_neg) / diff);

            let error = analytical - approx;
            let scale = analytical.norm().max(1.);
            assert!(
                error.norm() / scale < 2e-2,
                "at {:?}: analytical={:?} approx={:?}",
                sample_point,
                analytical,
                approx
            );
        }
    }
}

#[test]
fn coincident_particles_have_no_gradient() {
    let g = spiky_gradient(V2::zeros(), 0.02);
    assert_eq!(g, V2::zeros());
    assert!(KernelCoefficients::new(0.02).is_finite());
    assert!(!KernelCoefficients::new(0.).is_finite());
}
