/*!
The compute "device": a rayon thread pool that runs one kernel invocation per
particle, batched into work groups, directly on the shared particle buffer.

Kernels never get a `&mut` to the buffer. A worker reads its own record, reads
other records through [`SharedView`] (restricted to the fields the kernel
declares in `SHARED_READS`) and finally writes the fields of its own record
named by its output type. A dispatch is rejected when a kernel would read a
field on other records that the same stage writes.
*/

use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    panic::{catch_unwind, AssertUnwindSafe},
    ptr,
    sync::atomic::{fence, AtomicU64, Ordering},
};

use crate::{
    concurrency::dispatch_workgroups,
    error::SimulationError,
    floating_type_mod::FT,
    neighborhood_search::{NeighborEnumeration, Neighborhood},
    particle_store::{Particle, ParticleStore},
    simulation_parameters::group_count,
    V2,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSet(u8);

impl FieldSet {
    pub const NONE: FieldSet = FieldSet(0);
    pub const POSITION: FieldSet = FieldSet(1 << 0);
    pub const VELOCITY: FieldSet = FieldSet(1 << 1);
    pub const FORCE: FieldSet = FieldSet(1 << 2);
    pub const DENSITY: FieldSet = FieldSet(1 << 3);
    pub const PRESSURE: FieldSet = FieldSet(1 << 4);

    pub const fn union(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 | other.0)
    }

    pub const fn contains(self, other: FieldSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: FieldSet) -> bool {
        self.0 & other.0 != 0
    }
}

impl fmt::Display for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (FieldSet::POSITION, "position"),
            (FieldSet::VELOCITY, "velocity"),
            (FieldSet::FORCE, "force"),
            (FieldSet::DENSITY, "density"),
            (FieldSet::PRESSURE, "pressure"),
        ];
        let listed: Vec<&str> = names
            .iter()
            .filter(|(field, _)| self.contains(*field))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{{{}}}", listed.join(", "))
    }
}

/// Result of one kernel invocation, written into the worker's own record.
pub trait StageOutput: Copy + Send {
    const FIELDS: FieldSet;

    /// # Safety
    /// `record` must point to a live particle record whose `FIELDS` are not
    /// accessed by any other thread during the call.
    unsafe fn write_to(self, record: *mut Particle);
}

pub trait ComputeKernel: Sync {
    const NAME: &'static str;

    /// Fields this kernel reads from records of other workers.
    const SHARED_READS: FieldSet;

    type Output: StageOutput;

    fn invoke(&self, i: usize, own: &Particle, shared: &SharedView<'_>, neighbors: &Neighborhood) -> Self::Output;
}

#[derive(Clone, Copy)]
struct RecordPtr(*mut Particle);
unsafe impl Sync for RecordPtr {}
unsafe impl Send for RecordPtr {}

impl RecordPtr {
    #[inline(always)]
    fn get(self) -> *mut Particle {
        self.0
    }
}

/// Field-wise read access to all records while a stage is running.
pub struct SharedView<'a> {
    base: *const Particle,
    len: usize,
    reads: FieldSet,
    _buffer: PhantomData<&'a [Particle]>,
}

// Only fields that no worker of the running stage writes are read through this view.
unsafe impl Sync for SharedView<'_> {}

macro_rules! shared_field_reader {
    ($name:ident, $field:ident, $ty:ty, $set:expr) => {
        #[inline(always)]
        pub fn $name(&self, j: usize) -> $ty {
            debug_assert!(self.reads.contains($set), concat!("kernel did not declare ", stringify!($field)));
            assert!(j < self.len);
            unsafe { ptr::addr_of!((*self.base.add(j)).$field).read() }
        }
    };
}

impl<'a> SharedView<'a> {
    shared_field_reader!(position, position, V2, FieldSet::POSITION);
    shared_field_reader!(velocity, velocity, V2, FieldSet::VELOCITY);
    shared_field_reader!(density, density, FT, FieldSet::DENSITY);
    shared_field_reader!(pressure, pressure, FT, FieldSet::PRESSURE);
}

pub struct ComputeContext {
    pool: rayon::ThreadPool,
    barriers_issued: AtomicU64,
}

impl ComputeContext {
    /// `num_threads == 0` uses one worker thread per logical core.
    pub fn new(num_threads: usize) -> Result<ComputeContext, SimulationError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("sph-worker-{}", i))
            .build()
            .map_err(|e| SimulationError::Initialization(format!("building worker pool failed: {}", e)))?;

        log::info!("compute context with {} worker threads", pool.current_num_threads());

        Ok(ComputeContext {
            pool,
            barriers_issued: AtomicU64::new(0),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn barriers_issued(&self) -> u64 {
        self.barriers_issued.load(Ordering::Relaxed)
    }

    /// Makes all writes of the finished dispatch visible to every later reader.
    pub fn barrier(&self) {
        fence(Ordering::SeqCst);
        self.barriers_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs `kernel` once per particle in `ceil(len / group_size)` work groups.
    /// Returns after every worker finished; the caller issues the barrier.
    pub fn dispatch<K: ComputeKernel>(
        &self,
        kernel: &K,
        store: &mut ParticleStore,
        neighbors: &Neighborhood,
        group_size: usize,
    ) -> Result<(), SimulationError> {
        let dispatch_error = |reason: String| SimulationError::Dispatch {
            stage: K::NAME,
            reason,
        };

        let num_particles = store.len();
        if group_size == 0 {
            return Err(dispatch_error(String::from("work group size is zero")));
        }
        if K::SHARED_READS.intersects(<K::Output as StageOutput>::FIELDS) {
            return Err(dispatch_error(format!(
                "kernel reads {} of other particles while writing {}",
                K::SHARED_READS,
                <K::Output as StageOutput>::FIELDS
            )));
        }
        if neighbors.particle_count() != num_particles {
            return Err(dispatch_error(format!(
                "neighborhood was built for {} particles, buffer holds {}",
                neighbors.particle_count(),
                num_particles
            )));
        }

        let records = store.records_mut();
        let base = RecordPtr(records.as_mut_ptr());
        let shared = SharedView {
            base: base.0 as *const Particle,
            len: num_particles,
            reads: K::SHARED_READS,
            _buffer: PhantomData,
        };
        let group_count = group_count(num_particles, group_size);

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.pool.install(|| {
                dispatch_workgroups(group_count, group_size, num_particles, |i| {
                    // SAFETY: `i < num_particles` and only worker `i` writes record `i`.
                    // Other workers read record `i` only through `SHARED_READS`,
                    // which is disjoint from the output fields.
                    unsafe {
                        let record = base.get().add(i);
                        let own = ptr::read(record);
                        let output = kernel.invoke(i, &own, &shared, neighbors);
                        output.write_to(record);
                    }
                });
            })
        }));

        result.map_err(|panic| dispatch_error(panic_message(panic)))
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("worker panicked: {}", s)
    } else {
        String::from("worker panicked")
    }
}

#[cfg(test)]
#[derive(Clone, Copy)]
struct DensityOutput(FT);

#[cfg(test)]
impl StageOutput for DensityOutput {
    const FIELDS: FieldSet = FieldSet::DENSITY;

    unsafe fn write_to(self, record: *mut Particle) {
        ptr::addr_of_mut!((*record).density).write(self.0);
    }
}

// counts the particles with a larger x coordinate
#[cfg(test)]
struct CountRight;

#[cfg(test)]
impl ComputeKernel for CountRight {
    const NAME: &'static str = "count-right";
    const SHARED_READS: FieldSet = FieldSet::POSITION;
    type Output = DensityOutput;

    fn invoke(&self, _i: usize, own: &Particle, shared: &SharedView<'_>, neighbors: &Neighborhood) -> DensityOutput {
        let mut count = 0.;
        neighbors.for_each_candidate(0, |j| {
            if shared.position(j).x > own.position.x {
                count += 1.;
            }
        });
        DensityOutput(count)
    }
}

// reads the field it writes
#[cfg(test)]
struct Hazard;

#[cfg(test)]
impl ComputeKernel for Hazard {
    const NAME: &'static str = "hazard";
    const SHARED_READS: FieldSet = FieldSet::POSITION.union(FieldSet::DENSITY);
    type Output = DensityOutput;

    fn invoke(&self, _i: usize, _own: &Particle, _shared: &SharedView<'_>, _: &Neighborhood) -> DensityOutput {
        DensityOutput(0.)
    }
}

#[cfg(test)]
struct Panics;

#[cfg(test)]
impl ComputeKernel for Panics {
    const NAME: &'static str = "panics";
    const SHARED_READS: FieldSet = FieldSet::NONE;
    type Output = DensityOutput;

    fn invoke(&self, i: usize, _own: &Particle, _shared: &SharedView<'_>, _: &Neighborhood) -> DensityOutput {
        if i == 3 {
            panic!("bad particle {}", i);
        }
        DensityOutput(1.)
    }
}

#[cfg(test)]
fn store_and_neighborhood(n: usize) -> (ParticleStore, Neighborhood) {
    use crate::{particle_store::LatticeConfig, simulation_parameters::NeighborhoodSearchAlgorithm};

    let lattice = LatticeConfig {
        columns: n,
        origin: V2::zeros(),
    };
    let store = ParticleStore::initialize(n, 1., lattice).unwrap();
    let mut neighborhood = Neighborhood::new(NeighborhoodSearchAlgorithm::AllPairs, n);
    neighborhood.rebuild(store.snapshot(), 1.);
    (store, neighborhood)
}

#[test]
fn dispatch_runs_every_worker_on_the_shared_buffer() {
    let context = ComputeContext::new(4).unwrap();
    let (mut store, neighborhood) = store_and_neighborhood(300);

    context.dispatch(&CountRight, &mut store, &neighborhood, 128).unwrap();
    context.barrier();

    for (i, p) in store.snapshot().iter().enumerate() {
        assert_eq!(p.density, (299 - i) as FT);
    }
    assert_eq!(context.barriers_issued(), 1);
}

#[test]
fn read_write_hazard_is_rejected() {
    let context = ComputeContext::new(2).unwrap();
    let (mut store, neighborhood) = store_and_neighborhood(10);

    let err = context.dispatch(&Hazard, &mut store, &neighborhood, 4).unwrap_err();
    match err {
        SimulationError::Dispatch { stage, reason } => {
            assert_eq!(stage, "hazard");
            assert!(reason.contains("density"));
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn worker_panic_becomes_dispatch_error() {
    let context = ComputeContext::new(2).unwrap();
    let (mut store, neighborhood) = store_and_neighborhood(10);

    let err = context.dispatch(&Panics, &mut store, &neighborhood, 4).unwrap_err();
    assert!(matches!(err, SimulationError::Dispatch { stage: "panics", .. }));
}

#[test]
fn mismatched_neighborhood_and_zero_group_size_are_rejected() {
    let context = ComputeContext::new(2).unwrap();
    let (mut store, _) = store_and_neighborhood(10);
    let stale = Neighborhood::new(crate::simulation_parameters::NeighborhoodSearchAlgorithm::AllPairs, 5);

    assert!(context.dispatch(&CountRight, &mut store, &stale, 4).is_err());

    let (mut store, neighborhood) = store_and_neighborhood(10);
    assert!(context.dispatch(&CountRight, &mut store, &neighborhood, 0).is_err());
}

#[test]
fn field_set_display_lists_fields() {
    let set = FieldSet::POSITION.union(FieldSet::PRESSURE);
    assert_eq!(set.to_string(), "{position, pressure}");
    assert!(set.contains(FieldSet::POSITION));
    assert!(!set.intersects(FieldSet::FORCE));
}
