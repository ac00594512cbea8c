//! livewire-app - Settings and client bootstrap for livewire
//!
//! Loads `.livewire/config.toml`, turns it into a [`livewire_link::LinkConfig`]
//! and starts a [`livewire_link::LinkClient`] from it.

pub mod bootstrap;
pub mod config;

pub use bootstrap::{build_link_config, start_link, start_link_with};
pub use config::{load_settings, load_settings_from, load_settings_strict, Settings};
