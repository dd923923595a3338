mod headless;
mod main_loop;
#[cfg(feature = "window")]
mod rendering;
mod snapshot;

pub use headless::{HeadlessHost, RunLimits};
pub use main_loop::{merge_params, start};
#[cfg(feature = "window")]
pub use rendering::WindowHost;
pub use snapshot::{rasterize, SnapshotWriter, Viewport};
