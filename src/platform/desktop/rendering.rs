use sdl2::{event::Event, keyboard::Keycode, pixels::Color, rect::Rect, EventPump};

use crate::{diagnostics::FrameDiagnostics, pipeline::FrameHost, Particle, SimulationError, SimulationParams};

use super::{
    headless::RunLimits,
    snapshot::{free_photo_path, rasterize, speed_color_map, write_png, Viewport, BACKGROUND},
};

/// SDL2 window drawing one dot per particle, with the diagnostics line as title.
pub struct WindowHost {
    event_pump: EventPump,
    canvas: sdl2::render::WindowCanvas,
    viewport: Viewport,
    limits: RunLimits,
    last: FrameDiagnostics,
    photo_requested: bool,
}

impl WindowHost {
    pub fn new(params: &SimulationParams, limits: RunLimits) -> Result<WindowHost, SimulationError> {
        let window_width: u32 = 800;
        let window_height: u32 = 800;

        let init_error = |e: String| SimulationError::Initialization(format!("creating window failed: {}", e));

        let sdl_context = sdl2::init().map_err(init_error)?;
        let video_subsystem = sdl_context.video().map_err(init_error)?;
        let window = video_subsystem
            .window("sph2d", window_width, window_height)
            .position_centered()
            .build()
            .map_err(|e| init_error(e.to_string()))?;

        let canvas = window.into_canvas().build().map_err(|e| init_error(e.to_string()))?;
        let event_pump = sdl_context.event_pump().map_err(init_error)?;

        Ok(WindowHost {
            event_pump,
            canvas,
            viewport: Viewport {
                bounds_min: params.bounds_min,
                bounds_max: params.bounds_max,
                width: window_width,
                height: window_height,
            },
            limits,
            last: FrameDiagnostics::default(),
            photo_requested: false,
        })
    }

    fn draw(&mut self, particles: &[Particle]) -> Result<(), String> {
        let canvas = &mut self.canvas;
        canvas.set_draw_color(Color::RGB(BACKGROUND[0], BACKGROUND[1], BACKGROUND[2]));
        canvas.clear();

        let color_map = speed_color_map(particles);
        for particle in particles {
            let (x, y) = self.viewport.world_to_screen(particle.position);
            let [r, g, b] = color_map.get_u8(particle.velocity.norm());
            canvas.set_draw_color(Color::RGB(r, g, b));
            canvas.fill_rect(Rect::new(x - 1, y - 1, 2, 2))?;
        }

        canvas.present();
        Ok(())
    }
}

impl FrameHost for WindowHost {
    fn poll_close(&mut self) -> bool {
        for event in self.event_pump.poll_iter() {
            match event {
                Event::Quit { .. }
                | Event::KeyDown {
                    keycode: Some(Keycode::Escape),
                    ..
                } => return true,
                Event::KeyDown {
                    keycode: Some(Keycode::F12),
                    ..
                } => self.photo_requested = true,
                _ => {}
            }
        }
        self.limits.reached(self.last.frame_number, self.last.simulated_time)
    }

    fn present(&mut self, particles: &[Particle], diagnostics: &FrameDiagnostics) -> Result<(), SimulationError> {
        self.last = *diagnostics;

        self.canvas
            .window_mut()
            .set_title(&diagnostics.title_line())
            .map_err(|e| SimulationError::Present(e.to_string()))?;
        self.draw(particles).map_err(SimulationError::Present)?;

        if self.photo_requested {
            self.photo_requested = false;
            let path = free_photo_path("./photo");
            write_png(&path, self.viewport.width, self.viewport.height, &rasterize(particles, &self.viewport))?;
            log::info!("saved {}", path.display());
        }
        Ok(())
    }
}
