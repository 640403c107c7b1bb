// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Runtime configuration.
//!
//! Values come from `~/.fetchhub/config.json` when it exists, then from the
//! environment, then from command-line flags (applied by the binary).
//!
//! | Variable | Field |
//! |---|---|
//! | `FETCHHUB_PORT` | `port` |
//! | `FETCHHUB_BIND` | `bind_address` |
//! | `FETCHHUB_ARIA2_RPC` | `aria2_rpc_url` |
//! | `FETCHHUB_ARIA2_SECRET` | `aria2_secret` |
//! | `FETCHHUB_ARIA2_BIN` | `aria2_binary` |
//! | `FETCHHUB_HUB_ENDPOINT` | `hub_endpoint` |
//! | `HF_TOKEN` | `hub_token` |

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_PORT: u16 = 8790;
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Defaults to loopback; "0.0.0.0" exposes the API to the network.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_aria2_rpc_url")]
    pub aria2_rpc_url: String,
    #[serde(default = "default_aria2_secret")]
    pub aria2_secret: String,
    /// Path or command name of the daemon; `aria2c` on `PATH` when unset.
    #[serde(default)]
    pub aria2_binary: Option<String>,
    #[serde(default = "default_hub_endpoint")]
    pub hub_endpoint: String,
    /// Used by hub jobs whose start request carries no token.
    #[serde(default)]
    pub hub_token: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_aria2_rpc_url() -> String {
    "http://127.0.0.1:6800/jsonrpc".to_string()
}

fn default_aria2_secret() -> String {
    "fetchhub_aria2_secret".to_string()
}

fn default_hub_endpoint() -> String {
    "https://huggingface.co".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_bind_address(),
            aria2_rpc_url: default_aria2_rpc_url(),
            aria2_secret: default_aria2_secret(),
            aria2_binary: None,
            hub_endpoint: default_hub_endpoint(),
            hub_token: None,
        }
    }
}

impl Config {
    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(port) = get("FETCHHUB_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("FETCHHUB_PORT is not a valid port: {}", port))?;
        }
        if let Some(bind) = get("FETCHHUB_BIND") {
            self.bind_address = bind;
        }
        if let Some(url) = get("FETCHHUB_ARIA2_RPC") {
            self.aria2_rpc_url = url;
        }
        if let Some(secret) = get("FETCHHUB_ARIA2_SECRET") {
            self.aria2_secret = secret;
        }
        if let Some(bin) = get("FETCHHUB_ARIA2_BIN") {
            self.aria2_binary = Some(bin);
        }
        if let Some(endpoint) = get("FETCHHUB_HUB_ENDPOINT") {
            self.hub_endpoint = endpoint;
        }
        if let Some(token) = get("HF_TOKEN") {
            self.hub_token = Some(token);
        }
        Ok(())
    }

    /// Daemon executable to launch.
    pub fn aria2_binary(&self) -> &str {
        self.aria2_binary.as_deref().unwrap_or("aria2c")
    }

    /// RPC port the daemon should listen on, taken from the RPC URL.
    pub fn aria2_rpc_port(&self) -> Option<u16> {
        Url::parse(&self.aria2_rpc_url)
            .ok()
            .and_then(|u| u.port_or_known_default())
    }

    /// Copy safe to print.
    pub fn redacted(&self) -> Config {
        let mask = |s: &str| {
            if s.chars().count() <= 4 {
                "****".to_string()
            } else {
                format!("{}****", s.chars().take(4).collect::<String>())
            }
        };
        Config {
            aria2_secret: mask(&self.aria2_secret),
            hub_token: self.hub_token.as_deref().map(mask),
            ..self.clone()
        }
    }
}

/// `~/.fetchhub`, created on first use.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not find home directory")?;
    let dir = home.join(".fetchhub");
    if !dir.exists() {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ok(dir)
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// File config (or defaults) with environment overrides applied.
pub fn load_config() -> Result<Config> {
    let mut config = load_config_from(&config_path()?)?;
    config.apply_env()?;
    Ok(config)
}

/// Read a config file; a missing file yields defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
}

pub fn save_config(config: &Config) -> Result<()> {
    save_config_to(config, &config_path()?)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
