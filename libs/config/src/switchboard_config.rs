//! Switchboard Configuration Module
//!
//! Loads client and server options from TOML files with environment-specific
//! overrides and a `SWITCHBOARD__` environment-variable overlay.

use crate::options::{ClientOptions, ServerOptions};
use crate::routes::RouteDescriptor;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "config/switchboard.toml";
pub const ENV_PREFIX: &str = "SWITCHBOARD";
pub const ENV_SEPARATOR: &str = "__";

/// All named clients and servers of one process
#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub clients: HashMap<String, ClientOptions>,
    #[serde(default)]
    pub servers: HashMap<String, ServerOptions>,
}

impl SwitchboardConfig {
    /// Load configuration from files with environment overrides
    ///
    /// `environment` selects an optional `environments/<env>.toml` file next
    /// to the base file. Environment variables such as
    /// `SWITCHBOARD__CLIENTS__ORDERS__RECEIVER__TIMEOUT_MS` override both.
    pub fn load(base_path: Option<&Path>, environment: Option<&str>) -> Result<Self> {
        let base = base_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));

        let mut builder = Config::builder().add_source(File::from(base).required(true));

        if let Some(env) = environment {
            let env_file = base
                .parent()
                .unwrap_or(Path::new("."))
                .join("environments")
                .join(format!("{}.toml", env));

            if env_file.exists() {
                info!("Loading environment config: {:?}", env_file);
                builder = builder.add_source(File::from(env_file));
            } else {
                warn!("Environment config not found: {:?}", env_file);
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator(ENV_SEPARATOR)
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut loaded: SwitchboardConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        loaded.expand_env_vars()?;
        loaded.validate()?;

        debug!(
            clients = loaded.clients.len(),
            servers = loaded.servers.len(),
            "configuration loaded from {:?}",
            base
        );
        Ok(loaded)
    }

    /// Parse an in-memory TOML document, without file or environment overlays
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut loaded: SwitchboardConfig =
            toml::from_str(text).context("Failed to parse configuration")?;
        loaded.expand_env_vars()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn client(&self, name: &str) -> Option<&ClientOptions> {
        self.clients.get(name)
    }

    pub fn server(&self, name: &str) -> Option<&ServerOptions> {
        self.servers.get(name)
    }

    pub fn validate(&self) -> Result<()> {
        for (key, client) in &self.clients {
            client
                .validate()
                .with_context(|| format!("Invalid client '{}'", key))?;
        }
        for (key, server) in &self.servers {
            server
                .validate()
                .with_context(|| format!("Invalid server '{}'", key))?;
        }
        Ok(())
    }

    /// Expand `$VAR` / `${VAR}` references in broker endpoint addresses
    pub fn expand_env_vars(&mut self) -> Result<()> {
        for client in self.clients.values_mut() {
            for set in &mut client.routes {
                for route in set.send.iter_mut().chain(set.receive.iter_mut()) {
                    expand_route(route)?;
                }
            }
        }
        for server in self.servers.values_mut() {
            for set in &mut server.routes {
                for route in set.receive.iter_mut().chain(set.send.iter_mut()) {
                    expand_route(route)?;
                }
            }
        }
        Ok(())
    }
}

fn expand_route(route: &mut RouteDescriptor) -> Result<()> {
    let expanded = shellexpand::env(&route.route)
        .with_context(|| format!("Failed to expand route endpoint '{}'", route.route))?;
    route.route = expanded.into_owned();
    Ok(())
}

/// Convenience function to load configuration from the default location
pub fn load_config(environment: Option<&str>) -> Result<SwitchboardConfig> {
    SwitchboardConfig::load(None, environment)
}

/// Resolve the configuration path from `SWITCHBOARD_CONFIG` or the default
pub fn config_path_from_env() -> PathBuf {
    std::env::var("SWITCHBOARD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}
