/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for model-parallel setup.
//!
//! Defaults live in [`Config::default`]. [`Config::from_env`] overrides
//! them from `MEGATRON_*` environment variables and
//! [`Config::from_yaml`] loads a full configuration from disk.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use megatron_topology::ConfigurationError;
use megatron_topology::TcpReadiness;
use serde::Deserialize;
use serde::Serialize;

pub const INNER_PARALLELISM_ENV: &str = "MEGATRON_INNER_PARALLELISM";
pub const WAIT_PORT_ENV: &str = "MEGATRON_WAIT_PORT";
pub const READINESS_TIMEOUT_ENV: &str = "MEGATRON_READINESS_TIMEOUT";
pub const READINESS_RETRY_INTERVAL_ENV: &str = "MEGATRON_READINESS_RETRY_INTERVAL";
pub const SYNC_SHARDED_GRADS_ENV: &str = "MEGATRON_SYNC_SHARDED_GRADS";
pub const LOG_LEVEL_ENV: &str = "MEGATRON_LOG_LEVEL";

/// Model-parallel setup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of consecutive ranks forming one model-parallel group.
    inner_parallelism: usize,
    /// Whether ring roots wait for the other members before bootstrap.
    wait_port: bool,
    readiness_timeout: Duration,
    readiness_retry_interval: Duration,
    /// Also reduce gradients of sharded parameters across data-parallel
    /// replicas.
    sync_sharded_grads: bool,
    log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inner_parallelism: 1,
            wait_port: true,
            readiness_timeout: Duration::from_secs(5 * 60),
            readiness_retry_interval: Duration::from_secs(3),
            sync_sharded_grads: false,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration resolving variables through `lookup`. Values
    /// that fail to parse are logged and leave the default in place.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(parsed) = parse_var(&lookup, INNER_PARALLELISM_ENV, usize::from_str) {
            config.inner_parallelism = parsed;
        }
        if let Some(parsed) = parse_var(&lookup, WAIT_PORT_ENV, parse_bool) {
            config.wait_port = parsed;
        }
        if let Some(parsed) = parse_var(&lookup, READINESS_TIMEOUT_ENV, humantime::parse_duration)
        {
            config.readiness_timeout = parsed;
        }
        if let Some(parsed) = parse_var(
            &lookup,
            READINESS_RETRY_INTERVAL_ENV,
            humantime::parse_duration,
        ) {
            config.readiness_retry_interval = parsed;
        }
        if let Some(parsed) = parse_var(&lookup, SYNC_SHARDED_GRADS_ENV, parse_bool) {
            config.sync_sharded_grads = parsed;
        }
        if let Some(parsed) = parse_var(&lookup, LOG_LEVEL_ENV, |v| {
            tracing::Level::from_str(v).map(|_| v.to_lowercase())
        }) {
            config.log_level = parsed;
        }

        config
    }

    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.inner_parallelism == 0 {
            return Err(ConfigurationError::ZeroParallelism);
        }
        Ok(())
    }

    pub fn inner_parallelism(&self) -> usize {
        self.inner_parallelism
    }

    pub fn wait_port(&self) -> bool {
        self.wait_port
    }

    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    pub fn readiness_retry_interval(&self) -> Duration {
        self.readiness_retry_interval
    }

    pub fn sync_sharded_grads(&self) -> bool {
        self.sync_sharded_grads
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn with_inner_parallelism(mut self, inner_parallelism: usize) -> Self {
        self.inner_parallelism = inner_parallelism;
        self
    }

    pub fn with_wait_port(mut self, wait_port: bool) -> Self {
        self.wait_port = wait_port;
        self
    }

    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    pub fn with_sync_sharded_grads(mut self, sync: bool) -> Self {
        self.sync_sharded_grads = sync;
        self
    }

    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }

    /// A TCP readiness waiter using this configuration's patience.
    pub fn tcp_readiness(&self) -> TcpReadiness {
        TcpReadiness::new(self.readiness_timeout, self.readiness_retry_interval)
    }
}

fn parse_var<T, E: std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl FnOnce(&str) -> Result<T, E>,
) -> Option<T> {
    let value = lookup(name)?;
    match parse(value.trim()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            tracing::error!("ignoring {}={:?}: {}", name, value, err);
            None
        }
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(format!("expected a boolean, got `{}`", value)),
    }
}
