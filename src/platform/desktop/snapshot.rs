use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

use crate::{color_map::ColorMap, floating_type_mod::FT, Particle, SimulationError, V2};

pub const BACKGROUND: [u8; 3] = [16, 16, 24];

/// Maps the simulation box onto a `width` x `height` image, y pointing down.
#[derive(Debug, Clone, Copy)]
pub struct Viewport {
    pub bounds_min: V2,
    pub bounds_max: V2,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn world_to_screen(&self, p: V2) -> (i32, i32) {
        let extent = self.bounds_max - self.bounds_min;
        let u = (p.x - self.bounds_min.x) / extent.x;
        let v = (self.bounds_max.y - p.y) / extent.y;
        (
            (u * (self.width - 1) as FT).round() as i32,
            (v * (self.height - 1) as FT).round() as i32,
        )
    }

    pub fn contains(&self, (x, y): (i32, i32)) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }
}

pub fn speed_color_map(particles: &[Particle]) -> ColorMap {
    let max_speed = particles.iter().map(|p| p.velocity.norm()).fold(0., FT::max);
    ColorMap::speed(max_speed.max(1e-3))
}

/// One pixel per particle on an RGBA buffer.
pub fn rasterize(particles: &[Particle], viewport: &Viewport) -> Vec<u8> {
    let mut pixels = Vec::with_capacity(viewport.width as usize * viewport.height as usize * 4);
    for _ in 0..viewport.width * viewport.height {
        pixels.extend_from_slice(&[BACKGROUND[0], BACKGROUND[1], BACKGROUND[2], 255]);
    }

    let color_map = speed_color_map(particles);
    for particle in particles {
        let screen = viewport.world_to_screen(particle.position);
        if !viewport.contains(screen) {
            continue;
        }
        let idx = 4 * (screen.1 as usize * viewport.width as usize + screen.0 as usize);
        let [r, g, b] = color_map.get_u8(particle.velocity.norm());
        pixels[idx..idx + 4].copy_from_slice(&[r, g, b, 255]);
    }
    pixels
}

pub fn write_png(path: &Path, width: u32, height: u32, rgba: &[u8]) -> Result<(), SimulationError> {
    let present_error = |e: String| SimulationError::Present(format!("writing {}: {}", path.display(), e));

    let file = File::create(path).map_err(|e| present_error(e.to_string()))?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), width, height);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    encoder.set_source_gamma(png::ScaledFloat::new(1.0 / 2.2));
    let mut writer = encoder.write_header().map_err(|e| present_error(e.to_string()))?;
    writer
        .write_image_data(rgba)
        .map_err(|e| present_error(e.to_string()))?;
    Ok(())
}

/// First `<basepath>-<i>.png` that does not exist yet.
pub fn free_photo_path(basepath: &str) -> PathBuf {
    let mut i = 0;
    loop {
        let s = PathBuf::from(format!("{}-{}.png", basepath, i));
        if !s.exists() {
            return s;
        }
        i += 1;
    }
}

pub struct SnapshotWriter {
    dir: PathBuf,
    every: u64,
    viewport: Viewport,
}

impl SnapshotWriter {
    pub fn new(dir: PathBuf, every: u64, viewport: Viewport) -> Result<SnapshotWriter, SimulationError> {
        if every == 0 {
            return Err(SimulationError::Initialization(String::from(
                "snapshot interval must be at least one frame",
            )));
        }
        std::fs::create_dir_all(&dir).map_err(|e| {
            SimulationError::Initialization(format!("creating snapshot directory {}: {}", dir.display(), e))
        })?;
        Ok(SnapshotWriter { dir, every, viewport })
    }

    pub fn path_for(&self, frame_number: u64) -> PathBuf {
        self.dir.join(format!("frame-{:06}.png", frame_number))
    }

    /// Writes a snapshot when `frame_number` is due, returns the written path.
    pub fn maybe_write(&self, frame_number: u64, particles: &[Particle]) -> Result<Option<PathBuf>, SimulationError> {
        if frame_number % self.every != 0 {
            return Ok(None);
        }
        let path = self.path_for(frame_number);
        let rgba = rasterize(particles, &self.viewport);
        write_png(&path, self.viewport.width, self.viewport.height, &rgba)?;
        log::debug!("wrote snapshot {}", path.display());
        Ok(Some(path))
    }
}

#[cfg(test)]
fn test_viewport() -> Viewport {
    Viewport {
        bounds_min: crate::vec2f(-1., -1.),
        bounds_max: crate::vec2f(1., 1.),
        width: 101,
        height: 51,
    }
}

#[test]
fn box_corners_map_to_image_corners() {
    let viewport = test_viewport();
    assert_eq!(viewport.world_to_screen(crate::vec2f(-1., 1.)), (0, 0));
    assert_eq!(viewport.world_to_screen(crate::vec2f(1., -1.)), (100, 50));
    assert_eq!(viewport.world_to_screen(crate::vec2f(0., 0.)), (50, 25));
    assert!(!viewport.contains((101, 0)));
}

#[test]
fn rasterize_marks_particle_pixels() {
    let viewport = test_viewport();
    let particles = vec![Particle::at(crate::vec2f(0., 0.)), Particle::at(crate::vec2f(5., 5.))];
    let pixels = rasterize(&particles, &viewport);

    assert_eq!(pixels.len(), 101 * 51 * 4);
    let idx = 4 * (25 * 101 + 50);
    assert_ne!(&pixels[idx..idx + 3], &BACKGROUND[..]);
    assert_eq!(&pixels[0..4], &[BACKGROUND[0], BACKGROUND[1], BACKGROUND[2], 255]);
}

#[test]
fn snapshots_are_written_on_schedule() {
    let dir = std::env::temp_dir().join(format!("sph2d-snapshots-{}", std::process::id()));
    let writer = SnapshotWriter::new(dir.clone(), 10, test_viewport()).unwrap();
    let particles = vec![Particle::at(crate::vec2f(0.5, 0.5))];

    assert_eq!(writer.maybe_write(7, &particles).unwrap(), None);
    let path = writer.maybe_write(20, &particles).unwrap().unwrap();
    assert!(path.ends_with("frame-000020.png"));

    let decoder = png::Decoder::new(File::open(&path).unwrap());
    let reader = decoder.read_info().unwrap();
    assert_eq!(reader.info().width, 101);
    assert_eq!(reader.info().height, 51);

    std::fs::remove_dir_all(dir).unwrap();
    assert!(SnapshotWriter::new(std::env::temp_dir(), 0, test_viewport()).is_err());
}
