pub mod config;
pub mod types;

pub use config::Config;
pub use types::{CustomPage, ExtensionId, ExtensionKind, ExtensionRecord, HookKind, HookRecord, Manifest};
