//! Settings loader for .livewire/config.toml

use super::types::Settings;
use livewire_core::prelude::*;
use std::path::{Path, PathBuf};

const CONFIG_FILENAME: &str = "config.toml";
const LIVEWIRE_DIR: &str = ".livewire";

/// Path of the settings file for a project directory.
pub fn config_path(project_path: &Path) -> PathBuf {
    project_path.join(LIVEWIRE_DIR).join(CONFIG_FILENAME)
}

/// Load settings from `<project>/.livewire/config.toml`.
///
/// Never fails: a missing file, an unreadable file or invalid TOML all fall
/// back to defaults (the latter two with a warning).
pub fn load_settings(project_path: &Path) -> Settings {
    load_settings_from(&config_path(project_path))
}

/// Like [`load_settings`], for an arbitrary file.
pub fn load_settings_from(config_path: &Path) -> Settings {
    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Load settings from an explicitly named file. Unlike [`load_settings`],
/// every problem is an error.
pub fn load_settings_strict(config_path: &Path) -> Result<Settings> {
    if !config_path.exists() {
        return Err(Error::ConfigNotFound {
            path: config_path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(config_path)
        .map_err(|e| Error::config(format!("Failed to read {:?}: {}", config_path, e)))?;
    let settings = toml::from_str(&content)
        .map_err(|e| Error::config(format!("Failed to parse {:?}: {}", config_path, e)))?;

    info!("Loaded settings from {:?}", config_path);
    Ok(settings)
}

/// Create `.livewire/config.toml` with commented defaults if it is missing.
/// Returns the path of the config file.
pub fn init_config_dir(project_path: &Path) -> Result<PathBuf> {
    let livewire_dir = project_path.join(LIVEWIRE_DIR);

    if !livewire_dir.exists() {
        std::fs::create_dir_all(&livewire_dir)
            .map_err(|e| Error::config(format!("Failed to create .livewire dir: {}", e)))?;
    }

    let config_path = livewire_dir.join(CONFIG_FILENAME);
    if config_path.exists() {
        debug!("Config already present at {:?}", config_path);
        return Ok(config_path);
    }

    std::fs::write(&config_path, DEFAULT_CONFIG)
        .map_err(|e| Error::config(format!("Failed to write config.toml: {}", e)))?;
    info!("Created default config at {:?}", config_path);

    Ok(config_path)
}

const DEFAULT_CONFIG: &str = r#"# livewire configuration

[connection]
# endpoint = "wss://backend.example/ws"
dialect = "rpc"              # "rpc" or "session"
connect_timeout_ms = 3000
connect_poll_ms = 200
handshake_timeout_ms = 5000  # session dialect only
call_timeout_ms = 10000
# auth_token_env = "LIVEWIRE_TOKEN"

[connection.headers]
# x-api-key = "..."

[reconnect]
enabled = true
base_delay_ms = 1000
max_delay_ms = 30000
max_attempts = 12

[heartbeat]
interval_ms = 20000          # 0 disables heartbeats
grace_ms = 10000

[media]
target_fps = 1               # clamped to 1..=30
mime_type = "image/jpeg"
rpc_method = "media.frame"

[session]
model = ""
response_modalities = ["TEXT"]
# system_instruction = "..."
"#;
