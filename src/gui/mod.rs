//! Presentation
//!
//! Color conversion and the frame renderer.

pub mod color;
mod renderer;

pub use color::ColorUniforms;
pub use renderer::{CpuSurface, OverlayLayer, RenderOutcome, RenderSurface, Renderer};
