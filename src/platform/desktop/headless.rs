use crate::{diagnostics::FrameDiagnostics, pipeline::FrameHost, Particle, SimulationError};

use super::snapshot::SnapshotWriter;

/// Optional stop conditions shared by all hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunLimits {
    pub max_frames: Option<u64>,
    pub max_seconds: Option<f64>,
}

impl RunLimits {
    pub fn reached(&self, frame_number: u64, simulated_time: f64) -> bool {
        self.max_frames.map_or(false, |max| frame_number >= max)
            || self.max_seconds.map_or(false, |max| simulated_time >= max)
    }
}

/// Runs without a window: logs the diagnostics line and optionally writes
/// PNG snapshots.
pub struct HeadlessHost {
    limits: RunLimits,
    snapshots: Option<SnapshotWriter>,
    log_every: u64,
    last: FrameDiagnostics,
}

impl HeadlessHost {
    pub fn new(limits: RunLimits, snapshots: Option<SnapshotWriter>, log_every: u64) -> HeadlessHost {
        HeadlessHost {
            limits,
            snapshots,
            log_every: log_every.max(1),
            last: FrameDiagnostics::default(),
        }
    }

    pub fn last_diagnostics(&self) -> &FrameDiagnostics {
        &self.last
    }
}

impl FrameHost for HeadlessHost {
    fn poll_close(&mut self) -> bool {
        self.limits.reached(self.last.frame_number, self.last.simulated_time)
    }

    fn present(&mut self, particles: &[Particle], diagnostics: &FrameDiagnostics) -> Result<(), SimulationError> {
        self.last = *diagnostics;

        if diagnostics.frame_number % self.log_every == 0 {
            log::info!("{}", diagnostics.title_line());
        }

        if let Some(snapshots) = &self.snapshots {
            snapshots.maybe_write(diagnostics.frame_number, particles)?;
        }
        Ok(())
    }
}

#[test]
fn limits_stop_on_frames_or_time() {
    let none = RunLimits::default();
    assert!(!none.reached(u64::MAX, 1e9));

    let frames = RunLimits {
        max_frames: Some(10),
        max_seconds: None,
    };
    assert!(!frames.reached(9, 100.));
    assert!(frames.reached(10, 0.));

    let seconds = RunLimits {
        max_frames: None,
        max_seconds: Some(0.01),
    };
    assert!(!seconds.reached(99, 0.0099));
    assert!(seconds.reached(100, 0.01));
}

#[test]
fn headless_run_stops_at_frame_limit() {
    use crate::{SimulationParams, Simulation, LatticeConfig};

    let params = SimulationParams {
        particle_count: 64,
        lattice: LatticeConfig {
            columns: 8,
            ..LatticeConfig::default()
        },
        num_threads: 2,
        ..SimulationParams::default()
    };
    let mut simulation = Simulation::new(params, false).unwrap();
    let mut host = HeadlessHost::new(
        RunLimits {
            max_frames: Some(12),
            max_seconds: None,
        },
        None,
        5,
    );

    simulation.run(&mut host).unwrap();

    assert_eq!(simulation.frame_number(), 12);
    assert_eq!(host.last_diagnostics().frame_number, 12);
    assert_eq!(host.last_diagnostics().particle_count, 64);
}
