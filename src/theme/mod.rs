pub mod aurora;
pub mod context;
pub mod renderer;

pub use renderer::ThemeRenderer;
