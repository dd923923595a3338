use enum_dispatch::enum_dispatch;
use rstar::{primitives::GeomWithData, Point, RTree};

use crate::{
    concurrency::par_iter_mut1, floating_type_mod::FT, is_vector_finite, particle_store::Particle,
    simulation_parameters::NeighborhoodSearchAlgorithm, V, V2, V2I,
};

/// Upper bound for the cells along one axis of the uniform grid. Wider
/// particle clouds get cells larger than the smoothing radius.
pub const MAX_GRID_CELLS_PER_AXIS: usize = 1024;

/// Enumerates the particles a worker has to visit. Candidates may lie outside
/// the smoothing radius (the kernels weight them with zero), but no particle
/// within the radius may be missing.
#[enum_dispatch]
pub trait NeighborEnumeration {
    /// Called once per frame, after the positions of the previous frame are
    /// committed and before the density stage is dispatched.
    fn rebuild(&mut self, particles: &[Particle], h: FT);

    fn for_each_candidate(&self, i: usize, f: impl FnMut(usize));

    fn particle_count(&self) -> usize;
}

#[enum_dispatch(NeighborEnumeration)]
pub enum Neighborhood {
    AllPairs,
    UniformGrid,
    RStarTree,
}

impl Neighborhood {
    pub fn new(algorithm: NeighborhoodSearchAlgorithm, num_particles: usize) -> Neighborhood {
        match algorithm {
            NeighborhoodSearchAlgorithm::AllPairs => AllPairs { num_particles }.into(),
            NeighborhoodSearchAlgorithm::Grid => UniformGrid {
                neighs: NeighborhoodCache::new(num_particles),
            }
            .into(),
            NeighborhoodSearchAlgorithm::RStar => RStarTree {
                neighs: NeighborhoodCache::new(num_particles),
            }
            .into(),
        }
    }

    pub fn algorithm(&self) -> NeighborhoodSearchAlgorithm {
        match self {
            Neighborhood::AllPairs(_) => NeighborhoodSearchAlgorithm::AllPairs,
            Neighborhood::UniformGrid(_) => NeighborhoodSearchAlgorithm::Grid,
            Neighborhood::RStarTree(_) => NeighborhoodSearchAlgorithm::RStar,
        }
    }
}

/// Every particle is a candidate of every other particle.
pub struct AllPairs {
    num_particles: usize,
}

impl NeighborEnumeration for AllPairs {
    fn rebuild(&mut self, particles: &[Particle], _h: FT) {
        self.num_particles = particles.len();
    }

    fn for_each_candidate(&self, _i: usize, mut f: impl FnMut(usize)) {
        for j in 0..self.num_particles {
            f(j);
        }
    }

    fn particle_count(&self) -> usize {
        self.num_particles
    }
}

/**
 * This lists stores for each particle the particle indices of its neighbors
 * (including the particle itself).
 */
pub struct NeighborhoodCache {
    neighs: Vec<Vec<u32>>,
}

impl NeighborhoodCache {
    pub fn new(num_particles: usize) -> Self {
        NeighborhoodCache {
            neighs: (0..num_particles).map(|_| Vec::new()).collect(),
        }
    }

    pub fn iter<'a>(&'a self, i: usize) -> impl Iterator<Item = usize> + 'a {
        self.neighs[i].iter().map(|&x| x as usize)
    }

    pub fn neighbor_count(&self, i: usize) -> usize {
        self.neighs[i].len()
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    fn resize(&mut self, num_particles: usize) {
        self.neighs.resize_with(num_particles, Vec::new);
    }
}

pub struct UniformGrid {
    neighs: NeighborhoodCache,
}

impl UniformGrid {
    pub fn cache(&self) -> &NeighborhoodCache {
        &self.neighs
    }
}

impl NeighborEnumeration for UniformGrid {
    fn rebuild(&mut self, particles: &[Particle], h: FT) {
        self.neighs.resize(particles.len());
        for p_neighs in &mut self.neighs.neighs {
            p_neighs.clear();
        }

        // non-finite particles get no neighbors, the pipeline reports them after the frame
        let mut finite = particles.iter().map(|p| p.position).filter(is_vector_finite);
        let first = match finite.next() {
            Some(position) => position,
            None => return,
        };
        let (domain_min, domain_max) = finite.fold((first, first), |(lo, hi), x| (lo.inf(&x), hi.sup(&x)));

        // cells are never smaller than h, so the 3x3 scan still covers the smoothing radius
        let extent = domain_max - domain_min;
        let cell_size = FT::max(h, FT::max(extent.x, extent.y) / MAX_GRID_CELLS_PER_AXIS as FT);
        let particle_to_cell_pos =
            |particle_pos: V2| ((particle_pos - domain_min) / cell_size).map(|x| x.floor() as i32);

        let grid_size: V<usize, 2> = particle_to_cell_pos(domain_max).map(|x| x as usize + 3);
        let mut grid = CellGrid::new(V2I::new(-1, -1), grid_size);
        for (particle_id, particle) in particles.iter().enumerate() {
            if is_vector_finite(&particle.position) {
                grid.get_mut(particle_to_cell_pos(particle.position)).particle_ids.push(particle_id as u32);
            }
        }

        let h_sq = h * h;

        par_iter_mut1(&mut self.neighs.neighs, |particle_id, p_neighs| {
            let this_particle_position = particles[particle_id].position;
            if !is_vector_finite(&this_particle_position) {
                return;
            }
            let particle_cell_pos = particle_to_cell_pos(this_particle_position);

            for y in -1..=1 {
                for x in -1..=1 {
                    let cell_pos = particle_cell_pos + V2I::new(x, y);
                    if !grid.contains(cell_pos) {
                        continue;
                    }

                    for &neigh_particle_id in &grid.get(cell_pos).particle_ids {
                        let neigh_particle_position = particles[neigh_particle_id as usize].position;
                        if (neigh_particle_position - this_particle_position).norm_squared() > h_sq {
                            continue;
                        }
                        p_neighs.push(neigh_particle_id);
                    }
                }
            }
        });
    }

    fn for_each_candidate(&self, i: usize, f: impl FnMut(usize)) {
        self.neighs.iter(i).for_each(f);
    }

    fn particle_count(&self) -> usize {
        self.neighs.len()
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
struct RTreePoint {
    p: V2,
}

impl Point for RTreePoint {
    type Scalar = FT;

    const DIMENSIONS: usize = 2;

    fn generate(mut generator: impl FnMut(usize) -> Self::Scalar) -> Self {
        RTreePoint {
            p: V2::new(generator(0), generator(1)),
        }
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        self.p[index]
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        &mut self.p[index]
    }
}

type RTreeElem = GeomWithData<RTreePoint, u32>;

pub struct RStarTree {
    neighs: NeighborhoodCache,
}

impl NeighborEnumeration for RStarTree {
    fn rebuild(&mut self, particles: &[Particle], h: FT) {
        self.neighs.resize(particles.len());

        let rtree_elems: Vec<RTreeElem> = particles
            .iter()
            .enumerate()
            .map(|(idx, particle)| RTreeElem::new(RTreePoint { p: particle.position }, idx as u32))
            .collect();

        let rtree = RTree::<RTreeElem>::bulk_load(rtree_elems);

        let max_dist_sq = h * h;

        par_iter_mut1(&mut self.neighs.neighs, |i, p_neighs| {
            p_neighs.clear();
            let query = RTreePoint {
                p: particles[i].position,
            };
            for neigh_point in rtree.locate_within_distance(query, max_dist_sq) {
                p_neighs.push(neigh_point.data);
            }
        });
    }

    fn for_each_candidate(&self, i: usize, f: impl FnMut(usize)) {
        self.neighs.iter(i).for_each(f);
    }

    fn particle_count(&self) -> usize {
        self.neighs.len()
    }
}

struct Cell {
    particle_ids: Vec<u32>,
}

struct CellGrid {
    grid_min: V2I,
    size: V<usize, 2>,
    cells: Vec<Cell>,
}

impl CellGrid {
    fn new(grid_min: V2I, grid_size: V<usize, 2>) -> CellGrid {
        let num_elements = grid_size.x * grid_size.y;
        CellGrid {
            grid_min,
            size: grid_size,
            cells: (0..num_elements)
                .map(|_| Cell {
                    particle_ids: Vec::new(),
                })
                .collect(),
        }
    }

    fn contains(&self, cell_pos: V2I) -> bool {
        let local = cell_pos - self.grid_min;
        (0..2).all(|d| local[d] >= 0 && (local[d] as usize) < self.size[d])
    }

    fn pos_to_idx(&self, cell_pos: V2I) -> usize {
        let local = cell_pos - self.grid_min;
        debug_assert!(self.contains(cell_pos));
        local.x as usize + local.y as usize * self.size.x
    }

    fn get(&self, cell_pos: V2I) -> &Cell {
        &self.cells[self.pos_to_idx(cell_pos)]
    }

    fn get_mut(&mut self, cell_pos: V2I) -> &mut Cell {
        let idx = self.pos_to_idx(cell_pos);
        &mut self.cells[idx]
    }
}

#[cfg(test)]
fn random_particles(n: usize, extent: FT) -> Vec<Particle> {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(7);
    (0..n)
        .map(|_| Particle::at(V2::new(rng.gen_range(-extent..extent), rng.gen_range(-extent..extent))))
        .collect()
}

#[cfg(test)]
fn neighbors_within_radius(neighborhood: &Neighborhood, particles: &[Particle], i: usize, h: FT) -> Vec<usize> {
    let mut result = Vec::new();
    neighborhood.for_each_candidate(i, |j| {
        if (particles[i].position - particles[j].position).norm_squared() <= h * h {
            result.push(j);
        }
    });
    result.sort_unstable();
    result
}

#[test]
fn search_strategies_find_the_same_neighbors() {
    let h = 0.05;
    let particles = random_particles(600, 0.4);

    let mut all_pairs = Neighborhood::new(NeighborhoodSearchAlgorithm::AllPairs, particles.len());
    let mut grid = Neighborhood::new(NeighborhoodSearchAlgorithm::Grid, particles.len());
    let mut rstar = Neighborhood::new(NeighborhoodSearchAlgorithm::RStar, particles.len());
    all_pairs.rebuild(&particles, h);
    grid.rebuild(&particles, h);
    rstar.rebuild(&particles, h);

    for i in 0..particles.len() {
        let reference = neighbors_within_radius(&all_pairs, &particles, i, h);
        assert!(reference.contains(&i), "particle is not neighbor of itself");
        assert_eq!(reference, neighbors_within_radius(&grid, &particles, i, h));
        assert_eq!(reference, neighbors_within_radius(&rstar, &particles, i, h));
    }
}

#[test]
fn grid_neighbor_lists_are_symmetric() {
    let h = 0.05;
    let particles = random_particles(400, 0.3);
    let mut grid = UniformGrid {
        neighs: NeighborhoodCache::new(particles.len()),
    };
    grid.rebuild(&particles, h);

    for i in 0..particles.len() {
        for j in grid.cache().iter(i) {
            assert!(grid.cache().iter(j).any(|k| k == i), "neighborhood is not symmetric");
        }
        assert!(grid.cache().neighbor_count(i) >= 1);
    }
}

#[test]
fn rebuild_follows_particle_count() {
    let h = 0.05;
    let particles = random_particles(50, 0.3);
    let mut grid = Neighborhood::new(NeighborhoodSearchAlgorithm::Grid, 10);
    grid.rebuild(&particles, h);
    assert_eq!(grid.particle_count(), 50);
    assert_eq!(grid.algorithm(), NeighborhoodSearchAlgorithm::Grid);
}

#[test]
fn tiny_radius_keeps_grid_bounded() {
    let h = 1e-5;
    let mut particles = random_particles(300, 0.4);
    particles[1].position = particles[0].position + V2::new(h / 2., 0.);

    let mut grid = UniformGrid {
        neighs: NeighborhoodCache::new(particles.len()),
    };
    grid.rebuild(&particles, h);

    let mut all_pairs = Neighborhood::new(NeighborhoodSearchAlgorithm::AllPairs, particles.len());
    all_pairs.rebuild(&particles, h);
    let grid = Neighborhood::UniformGrid(grid);
    for i in 0..particles.len() {
        assert_eq!(
            neighbors_within_radius(&all_pairs, &particles, i, h),
            neighbors_within_radius(&grid, &particles, i, h)
        );
    }
    assert_eq!(neighbors_within_radius(&grid, &particles, 0, h), vec![0, 1]);
}

#[test]
fn non_finite_positions_do_not_break_the_grid() {
    let h = 0.05;
    let mut particles = random_particles(100, 0.3);
    particles[3].position.x = FT::NAN;
    particles[8].position.y = FT::INFINITY;

    let mut grid = UniformGrid {
        neighs: NeighborhoodCache::new(particles.len()),
    };
    grid.rebuild(&particles, h);

    assert_eq!(grid.cache().neighbor_count(3), 0);
    assert_eq!(grid.cache().neighbor_count(8), 0);
    for i in (0..particles.len()).filter(|&i| i != 3 && i != 8) {
        assert!(grid.cache().iter(i).any(|j| j == i));
        assert!(grid.cache().iter(i).all(|j| j != 3 && j != 8));
    }
}
