pub mod color_map;
pub mod compute;
pub mod concurrency;
pub mod diagnostics;
pub mod error;
pub mod neighborhood_search;
pub mod particle_store;
pub mod pipeline;
pub mod simulation_parameters;
pub mod sph_kernels;
pub mod stages;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::PI;
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::PI;
}

use floating_type_mod::FT;

use nalgebra::SVector;

pub type V<T, const D: usize> = SVector<T, D>;

pub type V2 = V<FT, 2>;
pub type V2I = V<i32, 2>;

pub fn vec2f(x: FT, y: FT) -> V2 {
    [x, y].into()
}

pub use error::SimulationError;
pub use particle_store::{LatticeConfig, Particle, ParticleStore};
pub use diagnostics::FrameDiagnostics;
pub use pipeline::{FrameHost, Pipeline, PipelineState, Simulation};
pub use simulation_parameters::SimulationParams;

use num_traits::Float;
use std::fmt::Display;

pub fn is_ft_approx_eq<T: Float>(a: T, b: T, tolerance: T) -> bool {
    assert!(!a.is_nan());
    assert!(!b.is_nan());
    b <= a + tolerance && b >= a - tolerance
}

pub fn assert_ft_approx_eq<T: Float + Display>(a: T, b: T, tolerance: T, s: impl FnOnce() -> String) {
    if !is_ft_approx_eq(a, b, tolerance) {
        panic!(
            "{} value not equal with a tolerance of {}:\n\ta={}\n\tb={}\n",
            s(),
            tolerance,
            a,
            b
        );
    }
}

#[inline]
pub fn is_vector_finite(v: &V2) -> bool {
    v.x.is_finite() && v.y.is_finite()
}
