// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use shipper_routing::{
    config, discovery::PathDiscoveryCache, endpoint::EndpointSelector, policy::PolicyStore,
    LabelSet,
};

const AGENT_TICK_INTERVAL: u64 = 10;
const PATH_LABEL: &str = "__path__";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("SHIPPER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config::Config::new() {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating config on shipper agent startup: {e}");
            return;
        }
    };

    let selector: Option<Arc<EndpointSelector>> = match config.selector_config() {
        Some(selector_config) => match EndpointSelector::start(selector_config) {
            Ok(selector) => Some(selector),
            Err(e) => {
                error!("Error starting endpoint selector: {e}");
                return;
            }
        },
        None => {
            info!("SHIPPER_DIRECTORY_URLS not set, endpoint selection disabled");
            None
        }
    };

    let policy = PolicyStore::start(config.policy_config());
    let discovery = PathDiscoveryCache::start(config.discovery_config());

    if config.watch_paths.is_empty() {
        warn!("SHIPPER_WATCH_PATHS not set, no paths will be resolved");
    }

    let mut tick_interval = interval(Duration::from_secs(AGENT_TICK_INTERVAL));
    tick_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tick_interval.tick().await;

        let endpoint = selector
            .as_ref()
            .map(|selector| selector.pick())
            .unwrap_or_default();

        for pattern in &config.watch_paths {
            resolve_watch_path(&policy, &discovery, pattern, &endpoint);
        }
    }
}

fn resolve_watch_path(
    policy: &PolicyStore,
    discovery: &PathDiscoveryCache,
    pattern: &str,
    endpoint: &str,
) {
    let labels = LabelSet::from([(PATH_LABEL.to_string(), pattern.to_string())]);

    if !policy.is_allowed(&labels) {
        debug!("Stream {pattern} blocked by policy");
        return;
    }

    let filter = policy.match_filter(&labels);
    match discovery.search(pattern, &filter.exclude_path, &filter.suffix) {
        Ok(paths) if paths.is_empty() => {
            debug!("No files resolved yet for {pattern}");
        }
        Ok(paths) => {
            if endpoint.is_empty() {
                info!("Resolved {} files for {pattern}, no endpoint known", paths.len());
            } else {
                info!("Resolved {} files for {pattern}, shipping to {endpoint}", paths.len());
            }
        }
        Err(e) => {
            warn!("Failed to resolve {pattern}: {e}");
        }
    }
}
