use std::time::{Duration, Instant};

use crate::{
    compute::{ComputeContext, ComputeKernel, StageOutput},
    diagnostics::{frames_per_second, write_statistics, FrameDiagnostics, PerformanceCounters, ValueCounters},
    floating_type_mod::FT,
    neighborhood_search::{NeighborEnumeration, Neighborhood},
    particle_store::{Particle, ParticleStore},
    stages::{DensityPressureProgram, ForceProgram, IntegrationProgram},
    SimulationError, SimulationParams,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    RunningDensity,
    RunningForce,
    RunningIntegration,
    Rendering,
}

impl PipelineState {
    pub fn next(self) -> PipelineState {
        match self {
            PipelineState::Idle => PipelineState::RunningDensity,
            PipelineState::RunningDensity => PipelineState::RunningForce,
            PipelineState::RunningForce => PipelineState::RunningIntegration,
            PipelineState::RunningIntegration => PipelineState::Rendering,
            PipelineState::Rendering => PipelineState::Idle,
        }
    }
}

/// Receives every finished frame. The simulation loop checks `poll_close`
/// only between frames.
pub trait FrameHost {
    fn poll_close(&mut self) -> bool;

    fn present(&mut self, particles: &[Particle], diagnostics: &FrameDiagnostics) -> Result<(), SimulationError>;
}

fn declared_hazard<K: ComputeKernel>() -> Option<String> {
    if K::SHARED_READS.intersects(<K::Output as StageOutput>::FIELDS) {
        Some(format!(
            "stage `{}` reads {} of other particles but writes {}",
            K::NAME,
            K::SHARED_READS,
            <K::Output as StageOutput>::FIELDS
        ))
    } else {
        None
    }
}

/// The three compiled programs, checked to work on the same constants.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline {
    pub density_pressure: DensityPressureProgram,
    pub force: ForceProgram,
    pub integration: IntegrationProgram,
    group_size: usize,
}

impl Pipeline {
    pub fn link(
        density_pressure: DensityPressureProgram,
        force: ForceProgram,
        integration: IntegrationProgram,
    ) -> Result<Pipeline, SimulationError> {
        let mut problems = Vec::new();

        let group_sizes = [density_pressure.group_size, force.group_size, integration.group_size];
        if group_sizes.iter().any(|&g| g == 0) {
            problems.push(String::from("work group size must be at least one"));
        }
        if group_sizes.iter().any(|&g| g != group_sizes[0]) {
            problems.push(format!("stages disagree on the work group size: {:?}", group_sizes));
        }
        if density_pressure.coefficients.h != force.coefficients.h {
            problems.push(format!(
                "smoothing radius differs: density-pressure h={}, force h={}",
                density_pressure.coefficients.h, force.coefficients.h
            ));
        }
        if density_pressure.mass != force.mass {
            problems.push(format!(
                "particle mass differs: density-pressure mass={}, force mass={}",
                density_pressure.mass, force.mass
            ));
        }
        problems.extend(declared_hazard::<DensityPressureProgram>());
        problems.extend(declared_hazard::<ForceProgram>());
        problems.extend(declared_hazard::<IntegrationProgram>());

        if !problems.is_empty() {
            let diagnostic = problems.join("\n");
            log::error!("linking pipeline failed:\n{}", diagnostic);
            return Err(SimulationError::KernelLink { diagnostic });
        }

        Ok(Pipeline {
            density_pressure,
            force,
            integration,
            group_size: group_sizes[0],
        })
    }

    pub fn compile(params: &SimulationParams) -> Result<Pipeline, SimulationError> {
        Pipeline::link(
            DensityPressureProgram::compile(params)?,
            ForceProgram::compile(params)?,
            IntegrationProgram::compile(params)?,
        )
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }
}

pub struct Simulation {
    params: SimulationParams,
    pipeline: Pipeline,
    context: ComputeContext,
    store: ParticleStore,
    neighborhood: Neighborhood,
    state: PipelineState,

    frame_number: u64,
    last_compute_time: Duration,

    pcounters: PerformanceCounters,
    vcounters: ValueCounters,
}

impl Simulation {
    pub fn new(params: SimulationParams, statistics_enabled: bool) -> Result<Simulation, SimulationError> {
        let pipeline = Pipeline::compile(&params)?;
        let store = ParticleStore::initialize(params.particle_count, params.lattice_spacing(), params.lattice)?;
        Self::assemble(params, pipeline, store, statistics_enabled)
    }

    /// Starts from explicit particle records instead of the lattice.
    pub fn with_particles(
        params: SimulationParams,
        particles: Vec<Particle>,
        statistics_enabled: bool,
    ) -> Result<Simulation, SimulationError> {
        let pipeline = Pipeline::compile(&params)?;
        let store = ParticleStore::from_particles(particles)?;
        Self::assemble(params, pipeline, store, statistics_enabled)
    }

    fn assemble(
        mut params: SimulationParams,
        pipeline: Pipeline,
        store: ParticleStore,
        statistics_enabled: bool,
    ) -> Result<Simulation, SimulationError> {
        let context = ComputeContext::new(params.num_threads)?;
        params.particle_count = store.len();

        log::info!(
            "simulation with {} particles ({} bytes) in {} work groups of {}, neighborhood search {:?}",
            store.len(),
            store.size_in_bytes(),
            params.group_count(),
            pipeline.group_size(),
            params.neighborhood_search_algorithm
        );

        Ok(Simulation {
            neighborhood: Neighborhood::new(params.neighborhood_search_algorithm, store.len()),
            params,
            pipeline,
            context,
            store,
            state: PipelineState::Idle,
            frame_number: 0,
            last_compute_time: Duration::ZERO,
            pcounters: PerformanceCounters::new(statistics_enabled),
            vcounters: ValueCounters::new(statistics_enabled),
        })
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn simulated_time(&self) -> f64 {
        self.frame_number as f64 * self.params.dt as f64
    }

    pub fn particles(&self) -> &[Particle] {
        self.store.snapshot()
    }

    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    pub fn context(&self) -> &ComputeContext {
        &self.context
    }

    fn advance(&mut self) {
        self.state = self.state.next();
        log::trace!("frame {}: {:?}", self.frame_number, self.state);
    }

    fn run_stage<K: ComputeKernel>(&mut self, kernel: &K) -> Result<(), SimulationError> {
        self.advance();
        self.pcounters.begin(K::NAME);
        self.context
            .dispatch(kernel, &mut self.store, &self.neighborhood, self.pipeline.group_size())?;
        self.context.barrier();
        self.pcounters.end(K::NAME);
        Ok(())
    }

    fn run_stages(&mut self) -> Result<(), SimulationError> {
        let pipeline = self.pipeline;
        self.run_stage(&pipeline.density_pressure)?;
        self.run_stage(&pipeline.force)?;
        self.run_stage(&pipeline.integration)?;

        // the next rebuild places particles by position, so non-finite state stops here
        match self.store.first_non_finite() {
            Some(i) => Err(SimulationError::Dispatch {
                stage: IntegrationProgram::NAME,
                reason: format!("particle {} is not finite: {:?}", i, self.store.snapshot()[i]),
            }),
            None => Ok(()),
        }
    }

    /**
     * Runs the three stages of one frame. Returns the time spent in the
     * dispatches and leaves the pipeline in `Rendering`; the next call
     * finishes that state first.
     */
    pub fn run_frame(&mut self) -> Result<Duration, SimulationError> {
        if self.state == PipelineState::Rendering {
            self.advance();
        }
        debug_assert_eq!(self.state, PipelineState::Idle);

        self.pcounters.begin("frame");

        self.pcounters.begin("neighborhood");
        self.neighborhood.rebuild(self.store.snapshot(), self.params.h);
        self.pcounters.end("neighborhood");

        let compute_start = Instant::now();
        if let Err(e) = self.run_stages() {
            log::error!("frame {} aborted in state {:?}: {}", self.frame_number, self.state, e);
            self.state = PipelineState::Idle;
            return Err(e);
        }
        self.last_compute_time = compute_start.elapsed();

        self.advance();
        self.frame_number += 1;
        self.pcounters.end("frame");

        if self.vcounters.enabled() {
            self.record_frame_values();
        }

        Ok(self.last_compute_time)
    }

    fn record_frame_values(&mut self) {
        let particles = self.store.snapshot();
        let max_speed = particles.iter().map(|p| p.velocity.norm()).fold(0., FT::max);
        let avg_density = particles.iter().map(|p| p.density).sum::<FT>() / particles.len() as FT;
        self.vcounters.add_value("max-speed", max_speed);
        self.vcounters.add_value("avg-density", avg_density);
    }

    /// Runs frames until the host asks to close or an error occurs.
    pub fn run<H: FrameHost>(&mut self, host: &mut H) -> Result<(), SimulationError> {
        let mut last_present = Instant::now();
        let mut host_time = Duration::ZERO;

        loop {
            let poll_start = Instant::now();
            if host.poll_close() {
                break;
            }
            host_time += poll_start.elapsed();

            let gpu_time = self.run_frame()?;

            let frame_time = last_present.elapsed();
            let diagnostics = FrameDiagnostics {
                frame_number: self.frame_number,
                simulated_time: self.simulated_time(),
                particle_count: self.store.len(),
                fps: frames_per_second(frame_time),
                frame_time,
                cpu_time: host_time,
                gpu_time,
            };

            let present_start = Instant::now();
            host.present(self.store.snapshot(), &diagnostics)?;
            host_time = present_start.elapsed();
            last_present = Instant::now();

            self.advance();
        }

        log::info!(
            "stopped after {} frames, simulated {:.4}s",
            self.frame_number,
            self.simulated_time()
        );
        Ok(())
    }

    pub fn statistics(&self) -> String {
        write_statistics(&self.pcounters, &self.vcounters)
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        log::debug!(
            "releasing particle buffer of {} bytes and {} worker threads",
            self.store.size_in_bytes(),
            self.context.num_threads()
        );
    }
}

#[cfg(test)]
fn small_params(columns: usize, rows: usize) -> SimulationParams {
    SimulationParams {
        particle_count: columns * rows,
        lattice: crate::LatticeConfig {
            columns,
            ..crate::LatticeConfig::default()
        },
        num_threads: 4,
        ..SimulationParams::default()
    }
}

#[cfg(test)]
struct RecordingHost {
    frames_until_close: usize,
    presented: Vec<FrameDiagnostics>,
    fail_at: Option<u64>,
}

#[cfg(test)]
impl FrameHost for RecordingHost {
    fn poll_close(&mut self) -> bool {
        self.presented.len() >= self.frames_until_close
    }

    fn present(&mut self, particles: &[Particle], diagnostics: &FrameDiagnostics) -> Result<(), SimulationError> {
        assert_eq!(particles.len(), diagnostics.particle_count);
        if Some(diagnostics.frame_number) == self.fail_at {
            return Err(SimulationError::Present(String::from("disk full")));
        }
        self.presented.push(*diagnostics);
        Ok(())
    }
}

#[test]
fn pipeline_state_cycles_through_stages() {
    let mut state = PipelineState::Idle;
    let mut visited = Vec::new();
    for _ in 0..5 {
        state = state.next();
        visited.push(state);
    }
    assert_eq!(
        visited,
        vec![
            PipelineState::RunningDensity,
            PipelineState::RunningForce,
            PipelineState::RunningIntegration,
            PipelineState::Rendering,
            PipelineState::Idle,
        ]
    );
}

#[test]
fn every_frame_issues_three_barriers() {
    let mut simulation = Simulation::new(small_params(10, 10), false).unwrap();
    assert_eq!(simulation.state(), PipelineState::Idle);

    simulation.run_frame().unwrap();
    assert_eq!(simulation.state(), PipelineState::Rendering);
    assert_eq!(simulation.context().barriers_issued(), 3);

    simulation.run_frame().unwrap();
    assert_eq!(simulation.context().barriers_issued(), 6);
    assert_eq!(simulation.frame_number(), 2);
    crate::assert_ft_approx_eq(simulation.simulated_time(), 2e-4, 1e-9, || String::from("time"));
}

#[test]
fn link_rejects_mismatched_programs() {
    let params = SimulationParams::default();
    let mut other = params;
    other.h = 0.03;
    other.mass = 0.05;
    other.group_size = 64;

    let err = Pipeline::link(
        DensityPressureProgram::compile(&params).unwrap(),
        ForceProgram::compile(&other).unwrap(),
        IntegrationProgram::compile(&params).unwrap(),
    )
    .unwrap_err();

    match err {
        SimulationError::KernelLink { diagnostic } => {
            assert!(diagnostic.contains("smoothing radius"));
            assert!(diagnostic.contains("mass"));
            assert!(diagnostic.contains("work group size"));
        }
        other => panic!("unexpected error {:?}", other),
    }

    let mut zero = params;
    zero.group_size = 0;
    assert!(matches!(
        Pipeline::compile(&zero),
        Err(SimulationError::KernelLink { .. })
    ));
}

#[test]
fn compile_errors_stop_simulation_setup() {
    let mut params = small_params(4, 4);
    params.dt = FT::NAN;
    let err = Simulation::new(params, false).err().unwrap();
    assert!(matches!(err, SimulationError::KernelCompile { kernel: "integration", .. }));
    assert!(err.is_fatal_before_first_frame());
}

#[test]
fn run_presents_frames_until_host_closes() {
    let mut simulation = Simulation::new(small_params(20, 10), true).unwrap();
    let mut host = RecordingHost {
        frames_until_close: 5,
        presented: Vec::new(),
        fail_at: None,
    };

    simulation.run(&mut host).unwrap();

    assert_eq!(simulation.frame_number(), 5);
    assert_eq!(simulation.state(), PipelineState::Idle);
    let frame_numbers: Vec<u64> = host.presented.iter().map(|d| d.frame_number).collect();
    assert_eq!(frame_numbers, vec![1, 2, 3, 4, 5]);
    assert!(host.presented.iter().all(|d| d.particle_count == 200));

    let statistics = simulation.statistics();
    assert!(statistics.contains("density-pressure: avg"));
    assert!(statistics.contains("max-speed"));
}

#[test]
fn present_failure_stops_the_run() {
    let mut simulation = Simulation::new(small_params(5, 5), false).unwrap();
    let mut host = RecordingHost {
        frames_until_close: 10,
        presented: Vec::new(),
        fail_at: Some(3),
    };

    let err = simulation.run(&mut host).unwrap_err();
    assert_eq!(err, SimulationError::Present(String::from("disk full")));
    assert_eq!(host.presented.len(), 2);
}

#[test]
fn momentum_is_conserved_on_a_ring() {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut params = SimulationParams {
        gravity: crate::V2::zeros(),
        neighborhood_search_algorithm: crate::simulation_parameters::NeighborhoodSearchAlgorithm::AllPairs,
        num_threads: 2,
        ..SimulationParams::default()
    };
    params.clamp_negative_pressure = false;

    // every particle sees the same neighborhood, so all densities agree
    let count = 12;
    let radius = 0.025;
    let mut rng = StdRng::seed_from_u64(11);
    let particles: Vec<Particle> = (0..count)
        .map(|k| {
            let angle = 2. * crate::floating_type_mod::PI * k as FT / count as FT;
            let mut p = Particle::at(crate::vec2f(radius * angle.cos(), radius * angle.sin()));
            p.velocity = crate::vec2f(rng.gen_range(-0.5..0.5), rng.gen_range(-0.5..0.5));
            p
        })
        .collect();

    let mut simulation = Simulation::with_particles(params, particles, false).unwrap();
    let before = simulation.store().total_momentum(params.mass);
    let velocities_before: Vec<_> = simulation.particles().iter().map(|p| p.velocity).collect();

    simulation.run_frame().unwrap();

    let after = simulation.store().total_momentum(params.mass);
    let impulse_scale: FT = simulation
        .particles()
        .iter()
        .zip(velocities_before.iter())
        .map(|(p, v)| (p.velocity - v).norm() * params.mass)
        .sum();

    let densities: Vec<FT> = simulation.particles().iter().map(|p| p.density).collect();
    for d in &densities {
        crate::assert_ft_approx_eq(*d, densities[0], densities[0] * 1e-4, || String::from("ring density"));
    }
    assert!(impulse_scale > 0.);
    assert!(
        (after - before).norm() <= impulse_scale * 1e-3,
        "momentum changed from {:?} to {:?} (impulse scale {})",
        before,
        after,
        impulse_scale
    );
}

#[test]
fn free_fall_accelerates_with_gravity() {
    let params = SimulationParams {
        gas_stiffness: 0.,
        viscosity: 0.,
        num_threads: 4,
        ..SimulationParams::default()
    };
    assert_eq!(params.particle_count, 125 * 160);

    let mut simulation = Simulation::new(params, false).unwrap();
    let steps = 50;
    for _ in 0..steps {
        simulation.run_frame().unwrap();
    }

    let expected = steps as FT * params.dt * params.gravity.y;
    for (i, p) in simulation.particles().iter().enumerate() {
        crate::assert_ft_approx_eq(p.velocity.y, expected, expected.abs() * 1e-4, || {
            format!("vertical velocity of particle {}", i)
        });
        assert_eq!(p.velocity.x, 0.);
        assert_eq!(p.pressure, 0.);
    }
}

#[test]
fn non_finite_state_ends_the_frame_with_an_error() {
    let nan_scene = vec![Particle::at(crate::vec2f(FT::NAN, 0.)), Particle::at(crate::vec2f(0.01, 0.))];
    assert!(matches!(
        Simulation::with_particles(small_params(2, 1), nan_scene, false),
        Err(SimulationError::Initialization(_))
    ));

    let mut simulation = Simulation::new(small_params(10, 10), false).unwrap();
    simulation.run_frame().unwrap();
    simulation.store.records_mut()[7].velocity.x = FT::NAN;

    match simulation.run_frame() {
        Err(SimulationError::Dispatch { stage, reason }) => {
            assert_eq!(stage, "integration");
            assert!(reason.contains("not finite"), "{}", reason);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(simulation.state(), PipelineState::Idle);
    assert_eq!(simulation.frame_number(), 1);
}

#[test]
fn run_reports_instantaneous_fps() {
    let mut simulation = Simulation::new(small_params(5, 5), false).unwrap();
    let mut host = RecordingHost {
        frames_until_close: 3,
        presented: Vec::new(),
        fail_at: None,
    };

    simulation.run(&mut host).unwrap();

    for d in &host.presented {
        assert!(d.frame_time > Duration::ZERO);
        crate::assert_ft_approx_eq(d.fps, 1. / d.frame_time.as_secs_f64(), d.fps * 1e-9, || {
            format!("fps of frame {}", d.frame_number)
        });
    }
}

#[cfg(test)]
fn assert_stable_for(params: SimulationParams, frames: usize) {
    let mut simulation = Simulation::new(params, false).unwrap();
    for frame in 0..frames {
        simulation.run_frame().unwrap();

        if let Some(i) = simulation.store().first_non_finite() {
            panic!("particle {} is not finite after frame {}: {:?}", i, frame, simulation.particles()[i]);
        }
        for p in simulation.particles() {
            assert!(
                p.position.x >= params.bounds_min.x
                    && p.position.x <= params.bounds_max.x
                    && p.position.y >= params.bounds_min.y
                    && p.position.y <= params.bounds_max.y,
                "particle left the box after frame {}: {:?}",
                frame,
                p.position
            );
        }
    }
}

#[test]
fn default_constants_stay_finite_and_contained() {
    assert_stable_for(small_params(40, 50), 1000);
}

#[test]
#[ignore]
fn full_scene_stays_finite_for_1000_frames() {
    assert_stable_for(SimulationParams::default(), 1000);
}
