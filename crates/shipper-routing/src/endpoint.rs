// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Collector endpoint selection.
//!
//! The directory service answers with a two level JSON document: an envelope whose field holds
//! another JSON document as a string, whose own field holds the server list
//! `ip:port#weight|idc;ip:port#weight|idc;...`. The selector refreshes that list in the
//! background and hands endpoints out round-robin.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::DirectoryError;
use crate::http::build_client;
use crate::refresh::{spawn_refresh_loop, FirstTick, Refresher};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_LOOKUP_PATH: &str = "/dynamicKey/v1/wemqAccessLogServer.json";
pub const DEFAULT_ENVELOPE_FIELD: &str = "wemqAccessLogServer";
pub const DEFAULT_LIST_FIELD: &str = "wemqAccessServer";

// weight is captured to keep the record grammar stable, selection ignores it
const SERVER_INFO_PATTERN: &str = r"(?P<ip>.*?):(?P<port>.*?)#(?P<weight>.*?)\|(?P<idc>.*)";

// Randomized starting cursor so agents started together don't all hit the same endpoint first
const START_OFFSET_RANGE: usize = 100;

/// Configuration for the endpoint selector
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Directory service base URLs, tried in order until one answers
    pub base_urls: Vec<String>,
    /// Path of the lookup document, relative to each base URL
    pub lookup_path: String,
    /// Only keep endpoints from this IDC when set
    pub idc: Option<String>,
    /// Starting cursor. Randomized when `None`
    pub start_offset: Option<usize>,
    pub refresh_interval: Duration,
    /// Timeout for each directory service request
    pub timeout: Duration,
    pub proxy_url: Option<String>,
    /// Envelope field holding the encoded server list document
    pub envelope_field: String,
    /// Field of the decoded document holding the server list
    pub list_field: String,
}

impl SelectorConfig {
    pub fn new(base_urls: Vec<String>) -> Self {
        SelectorConfig {
            base_urls,
            lookup_path: DEFAULT_LOOKUP_PATH.to_string(),
            idc: None,
            start_offset: None,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            proxy_url: None,
            envelope_field: DEFAULT_ENVELOPE_FIELD.to_string(),
            list_field: DEFAULT_LIST_FIELD.to_string(),
        }
    }
}

/// One record of the server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub ip: String,
    pub port: String,
    pub weight: String,
    pub idc: String,
}

impl ServerRecord {
    /// Parses `ip:port#weight|idc`. Records without ip, port or idc are rejected.
    pub fn parse(record: &str) -> Option<ServerRecord> {
        let captures = server_info_pattern().captures(record)?;
        let field = |name: &str| {
            captures
                .name(name)
                .map(|m| m.as_str().to_string())
                .unwrap_or_default()
        };
        let server = ServerRecord {
            ip: field("ip"),
            port: field("port"),
            weight: field("weight"),
            idc: field("idc"),
        };
        if server.ip.is_empty() || server.port.is_empty() || server.idc.is_empty() {
            return None;
        }
        Some(server)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

fn server_info_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    PATTERN.get_or_init(|| Regex::new(SERVER_INFO_PATTERN).expect("server info pattern is valid"))
}

/// Turns a `;` separated server list into endpoint addresses, keeping only the given IDC when
/// one is set. Malformed records are dropped.
pub fn parse_server_list(server_list: &str, idc: Option<&str>) -> Vec<String> {
    server_list
        .split(';')
        .filter_map(ServerRecord::parse)
        .filter(|server| idc.map_or(true, |idc| server.idc == idc))
        .map(|server| server.address())
        .collect()
}

/// Extracts the server list string out of a directory service response body.
pub fn decode_directory_response(
    body: &[u8],
    envelope_field: &str,
    list_field: &str,
) -> Result<String, DirectoryError> {
    let envelope: Value =
        serde_json::from_slice(body).map_err(|e| DirectoryError::Envelope(e.to_string()))?;
    let encoded = envelope
        .get(envelope_field)
        .and_then(Value::as_str)
        .ok_or_else(|| DirectoryError::Envelope(format!("missing string field {envelope_field}")))?;

    let document: Value =
        serde_json::from_str(encoded).map_err(|e| DirectoryError::ServerList(e.to_string()))?;
    document
        .get(list_field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DirectoryError::ServerList(format!("missing string field {list_field}")))
}

/// Round-robin selector over the endpoints published by the directory service.
///
/// The endpoint list is an immutable snapshot swapped atomically on refresh; the cursor is a
/// separate atomic counter, reduced modulo the length of whichever snapshot a caller loaded.
pub struct EndpointSelector {
    config: SelectorConfig,
    client: reqwest::Client,
    endpoints: ArcSwap<Vec<String>>,
    cursor: AtomicUsize,
}

impl std::fmt::Debug for EndpointSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointSelector")
            .field("config", &self.config)
            .field("endpoints", &self.endpoints.load())
            .finish()
    }
}

impl EndpointSelector {
    /// Creates a selector with an empty registry. Nothing is fetched until [`Self::start`] or
    /// [`Self::refresh_once`].
    pub fn new(config: SelectorConfig) -> Result<Self, DirectoryError> {
        let client = build_client(config.proxy_url.as_deref(), config.timeout)
            .map_err(|e| DirectoryError::Client(e.to_string()))?;
        let start_offset = config
            .start_offset
            .unwrap_or_else(|| fastrand::usize(..START_OFFSET_RANGE));
        Ok(EndpointSelector {
            config,
            client,
            endpoints: ArcSwap::from_pointee(Vec::new()),
            cursor: AtomicUsize::new(start_offset),
        })
    }

    /// Creates a selector and spawns its refresh loop. The first refresh runs right away.
    pub fn start(config: SelectorConfig) -> Result<Arc<Self>, DirectoryError> {
        let selector = Arc::new(Self::new(config)?);
        spawn_refresh_loop(
            Arc::clone(&selector),
            selector.config.refresh_interval,
            FirstTick::Immediate,
        );
        info!(
            "ENDPOINTS | selector started with directory {:?}, idc {:?}, start offset {}",
            selector.config.base_urls,
            selector.config.idc,
            selector.cursor.load(Ordering::Relaxed)
        );
        Ok(selector)
    }

    /// Returns the next endpoint, or an empty string while no endpoint is known.
    pub fn pick(&self) -> String {
        let endpoints = self.endpoints.load();
        if endpoints.is_empty() {
            return String::new();
        }
        let next = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % endpoints.len();
        let endpoint = endpoints[next].clone();
        debug!("ENDPOINTS | picked {endpoint}");
        endpoint
    }

    /// Current registry snapshot.
    pub fn endpoints(&self) -> Arc<Vec<String>> {
        self.endpoints.load_full()
    }

    /// Fetches the server list once and installs it. Returns the number of endpoints installed.
    /// On error the previous registry is left untouched.
    pub async fn refresh_once(&self) -> Result<usize, DirectoryError> {
        let server_list = self.fetch_server_list().await?;
        let endpoints = parse_server_list(&server_list, self.config.idc.as_deref());
        let count = endpoints.len();

        if *self.endpoints.load_full() == endpoints {
            debug!("ENDPOINTS | endpoint list unchanged ({count} endpoints)");
        } else {
            info!("ENDPOINTS | endpoint list refreshed: {endpoints:?}");
            self.endpoints.store(Arc::new(endpoints));
        }
        Ok(count)
    }

    async fn fetch_server_list(&self) -> Result<String, DirectoryError> {
        let mut last_error = DirectoryError::NoBaseUrl;
        for base_url in &self.config.base_urls {
            match self.fetch_from(base_url).await {
                Ok(server_list) => return Ok(server_list),
                Err(e) => {
                    warn!("ENDPOINTS | {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn fetch_from(&self, base_url: &str) -> Result<String, DirectoryError> {
        let url = format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.config.lookup_path.trim_start_matches('/')
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| DirectoryError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DirectoryError::Status { url, status });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| DirectoryError::Request {
                url: url.clone(),
                source,
            })?;
        decode_directory_response(&body, &self.config.envelope_field, &self.config.list_field)
    }

    #[cfg(test)]
    fn store_endpoints(&self, endpoints: Vec<String>) {
        self.endpoints.store(Arc::new(endpoints));
    }
}

#[async_trait]
impl Refresher for EndpointSelector {
    fn name(&self) -> &'static str {
        "ENDPOINTS"
    }

    async fn refresh(&self) {
        if let Err(e) = self.refresh_once().await {
            warn!(
                "ENDPOINTS | Skipping refresh, keeping {} known endpoints: {e}",
                self.endpoints.load().len()
            );
        }
    }
}
