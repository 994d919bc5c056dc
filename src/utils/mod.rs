pub mod batch_toml;
pub mod config;
pub mod env;
pub mod logger;

pub use config::*;
pub use batch_toml::load_settings;
pub use env::{db_path_from_env, resolve_db_path};
pub use logger::setup_logging;
