use std::ptr;

use super::CompileLog;
use crate::{
    compute::{ComputeKernel, FieldSet, SharedView, StageOutput},
    floating_type_mod::FT,
    is_vector_finite,
    neighborhood_search::Neighborhood,
    particle_store::Particle,
    SimulationError, SimulationParams, V2,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrationOutput {
    pub position: V2,
    pub velocity: V2,
}

impl StageOutput for IntegrationOutput {
    const FIELDS: FieldSet = FieldSet::POSITION.union(FieldSet::VELOCITY);

    unsafe fn write_to(self, record: *mut Particle) {
        ptr::addr_of_mut!((*record).position).write(self.position);
        ptr::addr_of_mut!((*record).velocity).write(self.velocity);
    }
}

/// Semi-implicit Euler step followed by the box boundary. Touches nothing but
/// the particle's own record.
#[derive(Debug, Clone, Copy)]
pub struct IntegrationProgram {
    pub dt: FT,
    pub bounds_min: V2,
    pub bounds_max: V2,
    pub boundary_damping: FT,
    pub group_size: usize,
}

impl IntegrationProgram {
    pub fn compile(params: &SimulationParams) -> Result<IntegrationProgram, SimulationError> {
        let mut log = CompileLog::default();
        log.positive("dt", params.dt);
        log.require(
            params.boundary_damping.is_finite() && (0. ..=1.).contains(&params.boundary_damping),
            || format!("boundary_damping={} must lie in [0, 1]", params.boundary_damping),
        );
        log.require(
            is_vector_finite(&params.bounds_min)
                && is_vector_finite(&params.bounds_max)
                && params.bounds_min.x < params.bounds_max.x
                && params.bounds_min.y < params.bounds_max.y,
            || {
                format!(
                    "bounds [{}, {}] x [{}, {}] do not form a box",
                    params.bounds_min.x, params.bounds_max.x, params.bounds_min.y, params.bounds_max.y
                )
            },
        );
        log.finish(Self::NAME)?;

        Ok(IntegrationProgram {
            dt: params.dt,
            bounds_min: params.bounds_min,
            bounds_max: params.bounds_max,
            boundary_damping: params.boundary_damping,
            group_size: params.group_size,
        })
    }

    pub fn step(&self, particle: &Particle) -> IntegrationOutput {
        let mut velocity = particle.velocity + particle.force * (self.dt / particle.density);
        let mut position = particle.position + velocity * self.dt;

        for d in 0..2 {
            let low = self.bounds_min[d];
            let high = self.bounds_max[d];
            if position[d] < low || position[d] > high {
                position[d] = position[d].clamp(low, high);
                velocity[d] *= -self.boundary_damping;
            }
        }

        IntegrationOutput { position, velocity }
    }
}

impl ComputeKernel for IntegrationProgram {
    const NAME: &'static str = "integration";
    const SHARED_READS: FieldSet = FieldSet::NONE;
    type Output = IntegrationOutput;

    fn invoke(&self, _i: usize, own: &Particle, _shared: &SharedView<'_>, _neighbors: &Neighborhood) -> IntegrationOutput {
        self.step(own)
    }
}

#[cfg(test)]
fn moving_particle(position: V2, velocity: V2) -> Particle {
    Particle {
        position,
        velocity,
        force: V2::zeros(),
        density: 1000.,
        pressure: 0.,
    }
}

#[test]
fn integration_is_semi_implicit_euler() {
    let program = IntegrationProgram::compile(&SimulationParams::default()).unwrap();
    let mut p = moving_particle(crate::vec2f(0., 0.), crate::vec2f(1., 0.));
    p.force = crate::vec2f(0., -2000.);

    let out = program.step(&p);

    let expected_velocity = crate::vec2f(1., -2000. * program.dt / 1000.);
    crate::assert_ft_approx_eq(out.velocity.y, expected_velocity.y, 1e-7, || String::from("vy"));
    crate::assert_ft_approx_eq(out.velocity.x, 1., 1e-7, || String::from("vx"));
    // position uses the updated velocity
    crate::assert_ft_approx_eq(out.position.y, expected_velocity.y * program.dt, 1e-9, || String::from("y"));
    crate::assert_ft_approx_eq(out.position.x, program.dt, 1e-9, || String::from("x"));
}

#[test]
fn wall_contact_reflects_and_damps_velocity() {
    let params = SimulationParams::default();
    let program = IntegrationProgram::compile(&params).unwrap();

    // on the right wall moving outwards
    let p = moving_particle(crate::vec2f(1., 0.5), crate::vec2f(4., -1.));
    let out = program.step(&p);
    assert_eq!(out.position.x, 1.);
    crate::assert_ft_approx_eq(out.velocity.x, -0.3 * 4., 1e-6, || String::from("vx"));
    assert_eq!(out.velocity.y, -1.);

    // through the bottom left corner
    let p = moving_particle(crate::vec2f(-0.99999, -0.99999), crate::vec2f(-10., -20.));
    let out = program.step(&p);
    assert_eq!(out.position, crate::vec2f(-1., -1.));
    crate::assert_ft_approx_eq(out.velocity.x, 3., 1e-5, || String::from("vx"));
    crate::assert_ft_approx_eq(out.velocity.y, 6., 1e-5, || String::from("vy"));
}

#[test]
fn inside_particles_are_not_reflected() {
    let program = IntegrationProgram::compile(&SimulationParams::default()).unwrap();
    let p = moving_particle(crate::vec2f(0.2, -0.3), crate::vec2f(-1., 1.));
    let out = program.step(&p);
    assert_eq!(out.velocity, crate::vec2f(-1., 1.));
    assert!(out.position.x < 0.2 && out.position.y > -0.3);
}

#[test]
fn invalid_integration_constants_fail_to_compile() {
    let mut params = SimulationParams::default();
    params.dt = 0.;
    params.boundary_damping = 1.5;
    params.bounds_min = crate::vec2f(1., -1.);

    match IntegrationProgram::compile(&params) {
        Err(SimulationError::KernelCompile { kernel, diagnostic }) => {
            assert_eq!(kernel, "integration");
            assert_eq!(diagnostic.lines().count(), 3);
        }
        other => panic!("unexpected result {:?}", other),
    }
}
