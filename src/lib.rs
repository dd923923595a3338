mod simulation;

pub use simulation::*;

pub mod platform;
