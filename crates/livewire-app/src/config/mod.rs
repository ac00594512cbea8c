//! Configuration file parsing for livewire
//!
//! Supports:
//! - `.livewire/config.toml` - Connection, reconnect, heartbeat, media and
//!   session settings

pub mod settings;
pub mod types;

pub use settings::{
    config_path, init_config_dir, load_settings, load_settings_from, load_settings_strict,
};
pub use types::*;
