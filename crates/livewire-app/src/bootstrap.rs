//! Starting a link from loaded settings.

use livewire_core::prelude::*;
use livewire_link::websocket::validate_endpoint;
use livewire_link::{Connector, LinkClient, LinkConfig, WsConnector};

use crate::config::Settings;

/// Build the engine configuration, resolving the bearer token named by
/// `[connection] auth_token_env`.
pub fn build_link_config(settings: &Settings, endpoint: Option<&str>) -> Result<LinkConfig> {
    let mut config = settings.to_link_config(endpoint)?;

    if let Some(var) = &settings.connection.auth_token_env {
        match std::env::var(var) {
            Ok(token) if !token.trim().is_empty() => {
                debug!("Using bearer token from ${}", var);
                config = config.with_header("Authorization", format!("Bearer {}", token.trim()));
            }
            _ => warn!("${} is not set; connecting without a bearer token", var),
        }
    }

    Ok(config)
}

/// Start a WebSocket link from `settings`.
pub fn start_link(settings: &Settings, endpoint: Option<&str>) -> Result<LinkClient> {
    let config = build_link_config(settings, endpoint)?;
    validate_endpoint(&config.endpoint)?;
    spawn(config, WsConnector)
}

/// Start a link over a caller-supplied connector.
pub fn start_link_with<C: Connector>(
    settings: &Settings,
    endpoint: Option<&str>,
    connector: C,
) -> Result<LinkClient> {
    let config = build_link_config(settings, endpoint)?;
    spawn(config, connector)
}

fn spawn<C: Connector>(config: LinkConfig, connector: C) -> Result<LinkClient> {
    info!(
        "Starting {} link to {} (reconnect {})",
        config.dialect,
        config.endpoint,
        if config.reconnect.enabled { "on" } else { "off" }
    );
    LinkClient::spawn(config, connector)
}
