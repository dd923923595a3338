use crate::{floating_type_mod::FT, particle_store::LatticeConfig, vec2f, V2};
use serde::{Deserialize, Serialize};

pub const PARTICLE_LENGTH: FT = 0.005;
pub const TIME_INTERVAL: FT = 0.0001;
pub const PARTICLE_COUNT: usize = 20000;
pub const GROUP_SIZE: usize = 128;

pub const PARTICLE_MASS: FT = 0.02;
pub const REST_DENSITY: FT = 1000.;
pub const GAS_STIFFNESS: FT = 2000.;
pub const VISCOSITY: FT = 3000.;
pub const GRAVITY_Y: FT = -9806.65;
pub const BOUNDARY_DAMPING: FT = 0.3;

pub fn group_count(particle_count: usize, group_size: usize) -> usize {
    (particle_count + group_size - 1) / group_size
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborhoodSearchAlgorithm {
    // reference: every worker tests every particle
    AllPairs,
    // cell size equals the smoothing radius
    Grid,
    RStar,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    pub particle_count: usize,
    // half of the lattice spacing
    pub particle_length: FT,
    pub dt: FT,
    pub group_size: usize,

    // smoothing radius, kernels vanish beyond it
    pub h: FT,
    pub mass: FT,
    pub gas_stiffness: FT,
    pub rest_density: FT,
    pub viscosity: FT,
    pub gravity: V2,

    pub boundary_damping: FT,
    pub bounds_min: V2,
    pub bounds_max: V2,

    // when false negative pressures (tension) reach the force stage unchanged
    pub clamp_negative_pressure: bool,

    pub neighborhood_search_algorithm: NeighborhoodSearchAlgorithm,
    pub lattice: LatticeConfig,

    // zero lets rayon pick the number of worker threads
    pub num_threads: usize,
}

impl Default for SimulationParams {
    fn default() -> Self {
        SimulationParams {
            particle_count: PARTICLE_COUNT,
            particle_length: PARTICLE_LENGTH,
            dt: TIME_INTERVAL,
            group_size: GROUP_SIZE,
            h: 4. * PARTICLE_LENGTH,
            mass: PARTICLE_MASS,
            gas_stiffness: GAS_STIFFNESS,
            rest_density: REST_DENSITY,
            viscosity: VISCOSITY,
            gravity: vec2f(0., GRAVITY_Y),
            boundary_damping: BOUNDARY_DAMPING,
            bounds_min: vec2f(-1., -1.),
            bounds_max: vec2f(1., 1.),
            clamp_negative_pressure: true,
            neighborhood_search_algorithm: NeighborhoodSearchAlgorithm::Grid,
            lattice: LatticeConfig::default(),
            num_threads: 0,
        }
    }
}

impl SimulationParams {
    pub fn lattice_spacing(&self) -> FT {
        2. * self.particle_length
    }

    pub fn group_count(&self) -> usize {
        group_count(self.particle_count, self.group_size)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<SimulationParams, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

#[test]
fn defaults_match_reference_scene() {
    let params = SimulationParams::default();
    assert_eq!(params.particle_count, 20000);
    assert_eq!(params.group_size, 128);
    assert_eq!(params.group_count(), 157);
    assert_eq!(params.lattice_spacing(), 2. * 0.005);
    assert_eq!(params.h, 0.02);
    assert!(params.clamp_negative_pressure);
}

#[test]
fn group_count_rounds_up() {
    assert_eq!(group_count(1, 128), 1);
    assert_eq!(group_count(128, 128), 1);
    assert_eq!(group_count(129, 128), 2);
    assert_eq!(group_count(0, 128), 0);
}

#[test]
fn partial_yaml_falls_back_to_defaults() {
    let params = SimulationParams::from_yaml_str("gas_stiffness: 0.0\nviscosity: 0.0\nneighborhood_search_algorithm: AllPairs\n")
        .expect("valid yaml");
    assert_eq!(params.gas_stiffness, 0.);
    assert_eq!(params.viscosity, 0.);
    assert_eq!(params.neighborhood_search_algorithm, NeighborhoodSearchAlgorithm::AllPairs);
    assert_eq!(params.particle_count, PARTICLE_COUNT);
    assert_eq!(params.gravity, vec2f(0., GRAVITY_Y));
}
