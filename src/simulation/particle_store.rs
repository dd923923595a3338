use serde::{Deserialize, Serialize};

use crate::{error::SimulationError, floating_type_mod::FT, is_vector_finite, vec2f, V2};

/// One element of the particle buffer. The layout is fixed so the record can be
/// handed to a renderer as a strided vertex array (position comes first).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub position: V2,
    pub velocity: V2,
    pub force: V2,
    pub density: FT,
    pub pressure: FT,
}

impl Particle {
    pub fn at(position: V2) -> Particle {
        Particle {
            position,
            velocity: V2::zeros(),
            force: V2::zeros(),
            density: 0.,
            pressure: 0.,
        }
    }
}

/// Placement of the initial particle block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatticeConfig {
    pub columns: usize,
    pub origin: V2,
}

impl Default for LatticeConfig {
    fn default() -> Self {
        // 125 x 160 particles for the default particle count
        LatticeConfig {
            columns: 125,
            origin: vec2f(-0.625, 1.),
        }
    }
}

impl LatticeConfig {
    pub fn rows(&self, count: usize) -> usize {
        (count + self.columns - 1) / self.columns
    }

    /// Row-major: particle `k` sits in row `k / columns` and column `k % columns`.
    /// Rows grow downwards from the origin.
    pub fn position(&self, k: usize, spacing: FT) -> V2 {
        let row = (k / self.columns) as FT;
        let col = (k % self.columns) as FT;
        vec2f(self.origin.x + spacing * col, self.origin.y - spacing * row)
    }
}

/// The single particle buffer. Its length is fixed at construction.
pub struct ParticleStore {
    particles: Vec<Particle>,
}

impl ParticleStore {
    pub fn initialize(count: usize, spacing: FT, lattice: LatticeConfig) -> Result<ParticleStore, SimulationError> {
        if count == 0 {
            return Err(SimulationError::Initialization(String::from(
                "particle store needs at least one particle",
            )));
        }
        if !(spacing.is_finite() && spacing > 0.) {
            return Err(SimulationError::Initialization(format!(
                "lattice spacing {} must be positive and finite",
                spacing
            )));
        }
        if lattice.columns == 0 {
            return Err(SimulationError::Initialization(String::from(
                "lattice needs at least one column",
            )));
        }

        let mut particles: Vec<Particle> = Vec::new();
        particles.try_reserve_exact(count).map_err(|e| {
            SimulationError::Initialization(format!(
                "allocating {} bytes for {} particles failed: {}",
                count.saturating_mul(std::mem::size_of::<Particle>()),
                count,
                e
            ))
        })?;
        particles.extend((0..count).map(|k| Particle::at(lattice.position(k, spacing))));

        log::debug!(
            "initialized {} particles on a {}x{} lattice with spacing {}",
            count,
            lattice.columns,
            lattice.rows(count),
            spacing
        );

        Ok(ParticleStore { particles })
    }

    /// Builds a store from explicit records (test scenes, restarts).
    pub fn from_particles(particles: Vec<Particle>) -> Result<ParticleStore, SimulationError> {
        if particles.is_empty() {
            return Err(SimulationError::Initialization(String::from(
                "particle store needs at least one particle",
            )));
        }
        let store = ParticleStore { particles };
        if let Some(i) = store.first_non_finite() {
            return Err(SimulationError::Initialization(format!(
                "particle {} is not finite: {:?}",
                i, store.particles[i]
            )));
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.particles.len() * std::mem::size_of::<Particle>()
    }

    /// Read-only view for the renderer.
    pub fn snapshot(&self) -> &[Particle] {
        &self.particles
    }

    pub(crate) fn records_mut(&mut self) -> &mut [Particle] {
        &mut self.particles
    }

    pub fn total_momentum(&self, mass: FT) -> V2 {
        self.particles
            .iter()
            .fold(V2::zeros(), |acc, p| acc + p.velocity * mass)
    }

    /// Index of the first particle holding a NaN or infinite attribute.
    pub fn first_non_finite(&self) -> Option<usize> {
        self.particles.iter().position(|p| {
            !(is_vector_finite(&p.position)
                && is_vector_finite(&p.velocity)
                && is_vector_finite(&p.force)
                && p.density.is_finite()
                && p.pressure.is_finite())
        })
    }
}

#[test]
fn lattice_is_row_major() {
    let lattice = LatticeConfig {
        columns: 3,
        origin: vec2f(-1., 1.),
    };
    let store = ParticleStore::initialize(7, 0.5, lattice).unwrap();
    let p = store.snapshot();

    assert_eq!(store.len(), 7);
    assert_eq!(lattice.rows(7), 3);
    assert_eq!(p[0].position, vec2f(-1., 1.));
    assert_eq!(p[2].position, vec2f(0., 1.));
    assert_eq!(p[3].position, vec2f(-1., 0.5));
    assert_eq!(p[6].position, vec2f(-1., 0.));
    for particle in p {
        assert_eq!(particle.velocity, V2::zeros());
        assert_eq!(particle.force, V2::zeros());
        assert_eq!(particle.density, 0.);
        assert_eq!(particle.pressure, 0.);
    }
}

#[test]
fn default_lattice_covers_reference_block() {
    let lattice = LatticeConfig::default();
    let spacing = 2. * 0.005;
    let store = ParticleStore::initialize(20000, spacing, lattice).unwrap();

    assert_eq!(lattice.rows(20000), 160);
    assert_eq!(store.size_in_bytes(), 20000 * std::mem::size_of::<Particle>());

    let last = store.snapshot()[19999].position;
    crate::assert_ft_approx_eq(last.x, -0.625 + 124. * spacing, 1e-5, || String::from("last x"));
    crate::assert_ft_approx_eq(last.y, 1. - 159. * spacing, 1e-5, || String::from("last y"));
}

#[test]
fn initialization_is_idempotent() {
    let a = ParticleStore::initialize(1000, 0.01, LatticeConfig::default()).unwrap();
    let b = ParticleStore::initialize(1000, 0.01, LatticeConfig::default()).unwrap();
    assert_eq!(a.snapshot(), b.snapshot());
}

#[test]
fn invalid_lattice_is_rejected() {
    assert!(matches!(
        ParticleStore::initialize(0, 0.01, LatticeConfig::default()),
        Err(SimulationError::Initialization(_))
    ));
    assert!(matches!(
        ParticleStore::initialize(10, FT::NAN, LatticeConfig::default()),
        Err(SimulationError::Initialization(_))
    ));
    assert!(matches!(
        ParticleStore::initialize(10, -0.01, LatticeConfig::default()),
        Err(SimulationError::Initialization(_))
    ));
}

#[test]
fn non_finite_particles_are_found() {
    let mut store = ParticleStore::initialize(10, 0.01, LatticeConfig::default()).unwrap();
    assert_eq!(store.first_non_finite(), None);
    store.records_mut()[4].pressure = FT::INFINITY;
    assert_eq!(store.first_non_finite(), Some(4));
}

#[test]
fn non_finite_records_are_rejected() {
    let mut particles: Vec<Particle> = (0..4).map(|k| Particle::at(vec2f(k as FT * 0.01, 0.))).collect();
    assert!(ParticleStore::from_particles(particles.clone()).is_ok());

    particles[2].position.x = FT::NAN;
    match ParticleStore::from_particles(particles) {
        Err(SimulationError::Initialization(msg)) => assert!(msg.contains("particle 2")),
        other => panic!("unexpected result {:?}", other.map(|s| s.len())),
    }
    assert!(ParticleStore::from_particles(Vec::new()).is_err());
}
