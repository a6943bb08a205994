// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Errors raised while refreshing the endpoint registry from the directory service
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("No directory service URL configured")]
    NoBaseUrl,

    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Directory service {url} answered with status {status}")]
    Status { url: String, status: StatusCode },

    #[error("Invalid directory envelope: {0}")]
    Envelope(String),

    #[error("Invalid server list document: {0}")]
    ServerList(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Errors raised while loading the policy document
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Failed to read policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy file format: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors recorded as the outcome of a path discovery computation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Invalid glob pattern {pattern}: {message}")]
    Pattern { pattern: String, message: String },

    #[error("Path scan failed: {0}")]
    Scan(String),
}

/// Errors raised while reading configuration from the environment
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}
