// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::discovery::{DiscoveryConfig, DEFAULT_MAX_JITTER, DEFAULT_STALE_AFTER};
use crate::endpoint::{SelectorConfig, DEFAULT_LOOKUP_PATH};
use crate::errors::ConfigError;
use crate::policy::PolicyConfig;

const DEFAULT_POLICY_PATH: &str = "/etc/shipper/acl.json";

#[derive(Debug)]
pub struct Config {
    /// Directory service base URLs, in failover order. Empty disables endpoint selection
    pub directory_urls: Vec<String>,
    pub directory_path: String,
    /// Locality filter for endpoints
    pub idc: Option<String>,
    pub policy_path: PathBuf,
    /// Globs resolved on every agent tick
    pub watch_paths: Vec<String>,
    pub discovery_max_jitter: Duration,
    pub stale_after: Duration,
    pub proxy_url: Option<String>,
}

impl Config {
    pub fn new() -> Result<Config, ConfigError> {
        let directory_urls = env::var("SHIPPER_DIRECTORY_URLS")
            .map(|val| split_list(&val))
            .unwrap_or_default();
        let directory_path = env::var("SHIPPER_DIRECTORY_PATH")
            .unwrap_or_else(|_| DEFAULT_LOOKUP_PATH.to_string());
        let idc = env::var("SHIPPER_IDC")
            .ok()
            .map(|val| val.trim().to_string())
            .filter(|val| !val.is_empty());
        let policy_path = env::var("SHIPPER_POLICY_PATH")
            .unwrap_or_else(|_| DEFAULT_POLICY_PATH.to_string())
            .into();
        let watch_paths = env::var("SHIPPER_WATCH_PATHS")
            .map(|val| split_list(&val))
            .unwrap_or_default();

        let discovery_max_jitter = Duration::from_millis(parse_u64(
            "SHIPPER_DISCOVERY_JITTER_MS",
            u64::try_from(DEFAULT_MAX_JITTER.as_millis()).unwrap_or(u64::MAX),
        )?);
        let stale_after = Duration::from_secs(parse_u64(
            "SHIPPER_STALE_AFTER_SECS",
            DEFAULT_STALE_AFTER.as_secs(),
        )?);

        Ok(Config {
            directory_urls,
            directory_path,
            idc,
            policy_path,
            watch_paths,
            discovery_max_jitter,
            stale_after,
            proxy_url: env::var("SHIPPER_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
        })
    }

    /// Endpoint selector settings, `None` when no directory service is configured.
    pub fn selector_config(&self) -> Option<SelectorConfig> {
        if self.directory_urls.is_empty() {
            return None;
        }
        let mut config = SelectorConfig::new(self.directory_urls.clone());
        config.lookup_path = self.directory_path.clone();
        config.idc = self.idc.clone();
        config.proxy_url = self.proxy_url.clone();
        Some(config)
    }

    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig::new(self.policy_path.clone())
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            max_jitter: self.discovery_max_jitter,
            stale_after: self.stale_after,
        }
    }
}

// Comma separated list, blanks dropped
fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidValue { name, value: val }),
        Err(_) => Ok(default),
    }
}
