use std::ptr;

use super::CompileLog;
use crate::{
    compute::{ComputeKernel, FieldSet, SharedView, StageOutput},
    floating_type_mod::FT,
    neighborhood_search::{NeighborEnumeration, Neighborhood},
    particle_store::Particle,
    sph_kernels::{poly6_with_coeff, KernelCoefficients},
    SimulationError, SimulationParams,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityPressureOutput {
    pub density: FT,
    pub pressure: FT,
}

impl StageOutput for DensityPressureOutput {
    const FIELDS: FieldSet = FieldSet::DENSITY.union(FieldSet::PRESSURE);

    unsafe fn write_to(self, record: *mut Particle) {
        ptr::addr_of_mut!((*record).density).write(self.density);
        ptr::addr_of_mut!((*record).pressure).write(self.pressure);
    }
}

/// Density by poly6 summation over all neighbors (the particle itself
/// included) and pressure from the linear equation of state.
#[derive(Debug, Clone, Copy)]
pub struct DensityPressureProgram {
    pub coefficients: KernelCoefficients,
    pub mass: FT,
    pub gas_stiffness: FT,
    pub rest_density: FT,
    pub clamp_negative_pressure: bool,
    pub group_size: usize,
}

impl DensityPressureProgram {
    pub fn compile(params: &SimulationParams) -> Result<DensityPressureProgram, SimulationError> {
        let coefficients = KernelCoefficients::new(params.h);

        let mut log = CompileLog::default();
        log.positive("h", params.h);
        log.positive("mass", params.mass);
        log.non_negative("gas_stiffness", params.gas_stiffness);
        log.non_negative("rest_density", params.rest_density);
        log.require(params.h <= 0. || coefficients.is_finite(), || {
            format!("poly6 coefficient for h={} is not representable", params.h)
        });
        log.finish(Self::NAME)?;

        Ok(DensityPressureProgram {
            coefficients,
            mass: params.mass,
            gas_stiffness: params.gas_stiffness,
            rest_density: params.rest_density,
            clamp_negative_pressure: params.clamp_negative_pressure,
            group_size: params.group_size,
        })
    }

    pub fn pressure(&self, density: FT) -> FT {
        let pressure = self.gas_stiffness * (density - self.rest_density);
        if self.clamp_negative_pressure {
            pressure.max(0.)
        } else {
            pressure
        }
    }

    /// Lower bound of every density this program computes: a lone particle.
    pub fn min_density(&self) -> FT {
        self.mass * self.coefficients.poly6_self()
    }
}

impl ComputeKernel for DensityPressureProgram {
    const NAME: &'static str = "density-pressure";
    const SHARED_READS: FieldSet = FieldSet::POSITION;
    type Output = DensityPressureOutput;

    fn invoke(&self, i: usize, own: &Particle, shared: &SharedView<'_>, neighbors: &Neighborhood) -> DensityPressureOutput {
        let c = &self.coefficients;

        let mut kernel_sum: FT = 0.;
        neighbors.for_each_candidate(i, |j| {
            let r_sq = (own.position - shared.position(j)).norm_squared();
            kernel_sum += poly6_with_coeff(r_sq, c.h_sq, c.poly6);
        });

        let density = self.mass * kernel_sum;
        DensityPressureOutput {
            density,
            pressure: self.pressure(density),
        }
    }
}

#[cfg(test)]
fn run_density(params: &SimulationParams, particles: Vec<Particle>) -> Vec<Particle> {
    use crate::{compute::ComputeContext, particle_store::ParticleStore};

    let program = DensityPressureProgram::compile(params).unwrap();
    let context = ComputeContext::new(2).unwrap();
    let mut store = ParticleStore::from_particles(particles).unwrap();
    let mut neighborhood = Neighborhood::new(params.neighborhood_search_algorithm, store.len());
    neighborhood.rebuild(store.snapshot(), params.h);

    context.dispatch(&program, &mut store, &neighborhood, params.group_size).unwrap();
    context.barrier();
    store.snapshot().to_vec()
}

#[test]
fn density_is_bounded_below_by_self_contribution() {
    use crate::particle_store::LatticeConfig;

    let params = SimulationParams::default();
    let lattice = LatticeConfig {
        columns: 30,
        ..LatticeConfig::default()
    };
    let particles: Vec<Particle> = (0..900)
        .map(|k| Particle::at(lattice.position(k, params.lattice_spacing())))
        .collect();
    let program = DensityPressureProgram::compile(&params).unwrap();

    let result = run_density(&params, particles);

    let lower_bound = program.min_density();
    assert!(lower_bound > 0.);
    for p in &result {
        assert!(p.density >= lower_bound * (1. - 1e-5), "density {} below {}", p.density, lower_bound);
        assert!(p.pressure >= 0.);
        assert_eq!(p.force, crate::V2::zeros());
    }

    // interior particles see more neighbors than corner particles
    assert!(result[15 * 30 + 15].density > result[0].density);
}

#[test]
fn isolated_particle_gets_self_density() {
    let mut params = SimulationParams::default();
    params.clamp_negative_pressure = false;
    // above the self density of a lone particle, so its state is in tension
    params.rest_density = 10000.;
    let particles = vec![
        Particle::at(crate::vec2f(0., 0.)),
        Particle::at(crate::vec2f(0.5, 0.5)),
    ];
    let program = DensityPressureProgram::compile(&params).unwrap();

    let result = run_density(&params, particles);

    let expected = program.min_density();
    assert!(expected < params.rest_density);
    crate::assert_ft_approx_eq(result[0].density, expected, expected * 1e-5, || String::from("density"));
    let expected_pressure = params.gas_stiffness * (expected - params.rest_density);
    assert!(result[0].pressure < 0.);
    crate::assert_ft_approx_eq(
        result[0].pressure,
        expected_pressure,
        expected_pressure.abs() * 1e-4,
        || String::from("pressure"),
    );
}

#[test]
fn negative_pressure_is_clamped_by_default() {
    let params = SimulationParams::default();
    let program = DensityPressureProgram::compile(&params).unwrap();
    assert_eq!(program.pressure(params.rest_density - 100.), 0.);
    assert_eq!(program.pressure(params.rest_density + 1.), params.gas_stiffness);
}

#[test]
fn densities_agree_between_search_strategies() {
    use crate::simulation_parameters::NeighborhoodSearchAlgorithm;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(3);
    let particles: Vec<Particle> = (0..500)
        .map(|_| Particle::at(crate::vec2f(rng.gen_range(-0.2..0.2), rng.gen_range(-0.2..0.2))))
        .collect();

    let mut params = SimulationParams::default();
    params.neighborhood_search_algorithm = NeighborhoodSearchAlgorithm::AllPairs;
    let reference = run_density(&params, particles.clone());

    for algorithm in [NeighborhoodSearchAlgorithm::Grid, NeighborhoodSearchAlgorithm::RStar] {
        params.neighborhood_search_algorithm = algorithm;
        let result = run_density(&params, particles.clone());
        for (a, b) in reference.iter().zip(result.iter()) {
            crate::assert_ft_approx_eq(a.density, b.density, a.density * 1e-4, || format!("{:?}", algorithm));
        }
    }
}

#[test]
fn invalid_constants_fail_to_compile() {
    let mut params = SimulationParams::default();
    params.h = 0.;
    params.mass = FT::NAN;

    match DensityPressureProgram::compile(&params) {
        Err(SimulationError::KernelCompile { kernel, diagnostic }) => {
            assert_eq!(kernel, "density-pressure");
            assert!(diagnostic.contains("h=0"));
            assert!(diagnostic.contains("mass=NaN"));
        }
        other => panic!("unexpected result {:?}", other),
    }
}
