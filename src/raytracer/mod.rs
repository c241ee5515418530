pub mod camera;
pub mod config;
pub mod error;
pub mod exporter;
pub mod framebuffer;
pub mod imageop;
pub mod renderer;
pub mod renderloop;
pub mod task_error;
pub mod tile;
