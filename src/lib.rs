pub mod cli;
pub mod core;
pub mod models;
pub mod plugins;
pub mod theme;
pub mod utils;

// 常用类型
pub use crate::core::{build_router, AppState, RouteMounter, UrlResolver};
pub use crate::models::{Config, ExtensionId, ExtensionKind, ExtensionRecord};
pub use crate::plugins::{Extension, ExtensionError, ExtensionRegistry, ExtensionRuntime, HookBus};
pub use crate::theme::ThemeRenderer;
