mod png;

use std::path::Path;

use crate::raytracer::error::Result;
use crate::raytracer::framebuffer::FrameBuffer;

pub use png::PngExporter;

pub trait Exporter {
    fn export(&self, framebuffer: &dyn FrameBuffer, path: &Path) -> Result<()>;
}
