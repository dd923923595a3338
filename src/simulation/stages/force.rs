use std::ptr;

use super::CompileLog;
use crate::{
    compute::{ComputeKernel, FieldSet, SharedView, StageOutput},
    floating_type_mod::FT,
    is_vector_finite,
    neighborhood_search::{NeighborEnumeration, Neighborhood},
    particle_store::Particle,
    sph_kernels::{spiky_gradient_with_coeff, viscosity_laplacian_with_coeff, KernelCoefficients},
    SimulationError, SimulationParams, V2,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForceOutput {
    pub force: V2,
}

impl StageOutput for ForceOutput {
    const FIELDS: FieldSet = FieldSet::FORCE;

    unsafe fn write_to(self, record: *mut Particle) {
        ptr::addr_of_mut!((*record).force).write(self.force);
    }
}

/**
 * Pressure force that particle `j` exerts on particle `i`, with
 * `diff = x_i - x_j`. The pressure is averaged over both particles, so for
 * equal densities the force on `j` from `i` is exactly the negative.
 */
#[inline(always)]
pub fn pairwise_pressure_force(
    coefficients: &KernelCoefficients,
    mass: FT,
    diff: V2,
    pressure_i: FT,
    pressure_j: FT,
    density_j: FT,
) -> V2 {
    let grad = spiky_gradient_with_coeff(diff, coefficients.h, coefficients.spiky_gradient);
    grad * (-mass * (pressure_i + pressure_j) / (2. * density_j))
}

/// Sum of pressure, viscosity and external (`density * gravity`) forces.
#[derive(Debug, Clone, Copy)]
pub struct ForceProgram {
    pub coefficients: KernelCoefficients,
    pub mass: FT,
    pub viscosity: FT,
    pub gravity: V2,
    pub group_size: usize,
}

impl ForceProgram {
    pub fn compile(params: &SimulationParams) -> Result<ForceProgram, SimulationError> {
        let coefficients = KernelCoefficients::new(params.h);

        let mut log = CompileLog::default();
        log.positive("h", params.h);
        log.positive("mass", params.mass);
        log.non_negative("viscosity", params.viscosity);
        log.require(is_vector_finite(&params.gravity), || {
            format!("gravity={:?} must be finite", params.gravity)
        });
        log.require(params.h <= 0. || coefficients.is_finite(), || {
            format!("spiky and viscosity coefficients for h={} are not representable", params.h)
        });
        log.finish(Self::NAME)?;

        Ok(ForceProgram {
            coefficients,
            mass: params.mass,
            viscosity: params.viscosity,
            gravity: params.gravity,
            group_size: params.group_size,
        })
    }
}

impl ComputeKernel for ForceProgram {
    const NAME: &'static str = "force";
    const SHARED_READS: FieldSet = FieldSet::POSITION
        .union(FieldSet::VELOCITY)
        .union(FieldSet::DENSITY)
        .union(FieldSet::PRESSURE);
    type Output = ForceOutput;

    fn invoke(&self, i: usize, own: &Particle, shared: &SharedView<'_>, neighbors: &Neighborhood) -> ForceOutput {
        let c = &self.coefficients;

        let mut pressure_force = V2::zeros();
        let mut viscosity_force = V2::zeros();

        neighbors.for_each_candidate(i, |j| {
            if j == i {
                return;
            }
            let diff = own.position - shared.position(j);
            let r_sq = diff.norm_squared();
            if r_sq > c.h_sq {
                return;
            }
            let density_j = shared.density(j);

            pressure_force += pairwise_pressure_force(c, self.mass, diff, own.pressure, shared.pressure(j), density_j);

            let laplacian = viscosity_laplacian_with_coeff(r_sq.sqrt(), c.h, c.viscosity_laplacian);
            viscosity_force += (shared.velocity(j) - own.velocity) * (self.mass * laplacian / density_j);
        });

        ForceOutput {
            force: pressure_force + viscosity_force * self.viscosity + self.gravity * own.density,
        }
    }
}

#[test]
fn pairwise_pressure_forces_cancel_for_equal_densities() {
    let params = SimulationParams::default();
    let program = ForceProgram::compile(&params).unwrap();
    let c = &program.coefficients;

    let x_i = crate::vec2f(0.1, 0.2);
    let x_j = crate::vec2f(0.108, 0.195);
    let (p_i, p_j) = (3.0e6, 1.2e6);
    let density = 1500.;

    let on_i = pairwise_pressure_force(c, program.mass, x_i - x_j, p_i, p_j, density);
    let on_j = pairwise_pressure_force(c, program.mass, x_j - x_i, p_j, p_i, density);

    assert!(on_i.norm() > 0.);
    // repulsive: pushes i away from j
    assert!(on_i.dot(&(x_i - x_j)) > 0.);
    let sum = on_i + on_j;
    assert!(sum.norm() <= on_i.norm() * 1e-5, "forces do not cancel: {:?} vs {:?}", on_i, on_j);
}

#[test]
fn coincident_pair_has_no_pressure_force() {
    let params = SimulationParams::default();
    let program = ForceProgram::compile(&params).unwrap();
    let f = pairwise_pressure_force(&program.coefficients, program.mass, V2::zeros(), 1e6, 1e6, 1000.);
    assert_eq!(f, V2::zeros());
}

#[test]
fn force_stage_on_a_pair_obeys_newton_three() {
    use crate::{compute::ComputeContext, particle_store::ParticleStore};

    let mut params = SimulationParams::default();
    params.gravity = V2::zeros();
    let program = ForceProgram::compile(&params).unwrap();

    let mut a = Particle::at(crate::vec2f(0., 0.));
    let mut b = Particle::at(crate::vec2f(0.006, 0.008));
    a.velocity = crate::vec2f(1., 0.);
    b.velocity = crate::vec2f(-0.5, 2.);
    for p in [&mut a, &mut b] {
        p.density = 4000.;
        p.pressure = 6.0e6;
    }

    let context = ComputeContext::new(2).unwrap();
    let mut store = ParticleStore::from_particles(vec![a, b]).unwrap();
    let mut neighborhood = Neighborhood::new(params.neighborhood_search_algorithm, 2);
    neighborhood.rebuild(store.snapshot(), params.h);
    context.dispatch(&program, &mut store, &neighborhood, 1).unwrap();
    context.barrier();

    let p = store.snapshot();
    let sum = p[0].force + p[1].force;
    assert!(p[0].force.norm() > 0.);
    assert!(sum.norm() <= p[0].force.norm() * 1e-5, "net force {:?}", sum);
    // density and pressure are inputs of this stage
    assert_eq!(p[0].density, 4000.);
    assert_eq!(p[1].pressure, 6.0e6);
}

#[test]
fn external_force_is_density_times_gravity() {
    use crate::{compute::ComputeContext, particle_store::ParticleStore};

    let params = SimulationParams::default();
    let program = ForceProgram::compile(&params).unwrap();

    let mut lone = Particle::at(crate::vec2f(0.3, 0.3));
    lone.density = 2500.;

    let context = ComputeContext::new(1).unwrap();
    let mut store = ParticleStore::from_particles(vec![lone]).unwrap();
    let mut neighborhood = Neighborhood::new(params.neighborhood_search_algorithm, 1);
    neighborhood.rebuild(store.snapshot(), params.h);
    context.dispatch(&program, &mut store, &neighborhood, params.group_size).unwrap();

    assert_eq!(store.snapshot()[0].force, params.gravity * 2500.);
}

#[test]
fn invalid_force_constants_fail_to_compile() {
    let mut params = SimulationParams::default();
    params.viscosity = -1.;
    params.gravity = crate::vec2f(0., FT::INFINITY);

    match ForceProgram::compile(&params) {
        Err(SimulationError::KernelCompile { kernel, diagnostic }) => {
            assert_eq!(kernel, "force");
            assert!(diagnostic.contains("viscosity"));
            assert!(diagnostic.contains("gravity"));
        }
        other => panic!("unexpected result {:?}", other),
    }
}
