// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous glob resolution for watch patterns.
//!
//! `search` never scans the filesystem itself: it queues at most one computation per pattern
//! and answers from the result cache. A single worker drains the queue serially, so only one
//! scan runs at a time. Each scan expands the glob, drops excluded paths, keeps configured
//! suffixes, and drops files that have not been modified within the staleness window.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use glob::{MatchOptions, Pattern};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::errors::DiscoveryError;

pub const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(3);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30 * 60);

// exclusion globs follow shell rules: `*` stays within one path segment
const EXCLUDE_MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Upper bound of the random delay before each scan
    pub max_jitter: Duration,
    /// Files not modified for this long are left out of the results
    pub stale_after: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            max_jitter: DEFAULT_MAX_JITTER,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTask {
    pub pattern: String,
    pub exclude_paths: Vec<String>,
    pub suffixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub matches: Vec<PathBuf>,
    pub error: Option<DiscoveryError>,
}

impl DiscoveryResult {
    fn to_result(&self) -> Result<Vec<PathBuf>, DiscoveryError> {
        match &self.error {
            Some(e) => Err(e.clone()),
            None => Ok(self.matches.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct DiscoveryState {
    // presence means a computation for the pattern is queued or running
    in_flight: DashMap<String, DiscoveryTask>,
    results: DashMap<String, Arc<DiscoveryResult>>,
    completed_scans: AtomicU64,
}

/// Caller side of path discovery. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PathDiscoveryCache {
    state: Arc<DiscoveryState>,
    tx: mpsc::UnboundedSender<DiscoveryTask>,
}

/// The single worker computing queued discovery tasks.
pub struct DiscoveryWorker {
    state: Arc<DiscoveryState>,
    rx: mpsc::UnboundedReceiver<DiscoveryTask>,
    config: DiscoveryConfig,
}

impl PathDiscoveryCache {
    /// Creates the cache and its worker. The worker must be run for results to appear.
    pub fn new(config: DiscoveryConfig) -> (Self, DiscoveryWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(DiscoveryState::default());
        let worker = DiscoveryWorker {
            state: Arc::clone(&state),
            rx,
            config,
        };
        (PathDiscoveryCache { state, tx }, worker)
    }

    /// Creates the cache and spawns its worker.
    pub fn start(config: DiscoveryConfig) -> Self {
        let (cache, worker) = Self::new(config);
        tokio::spawn(worker.run());
        cache
    }

    /// Queues a scan of `pattern` unless one is already in flight, then returns the last
    /// completed result for it. The first call for a pattern returns an empty list.
    pub fn search(
        &self,
        pattern: &str,
        exclude_paths: &[String],
        suffixes: &[String],
    ) -> Result<Vec<PathBuf>, DiscoveryError> {
        let queued = match self.state.in_flight.entry(pattern.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let task = DiscoveryTask {
                    pattern: pattern.to_string(),
                    exclude_paths: exclude_paths.to_vec(),
                    suffixes: suffixes.to_vec(),
                };
                entry.insert(task.clone());
                Some(task)
            }
        };

        if let Some(task) = queued {
            debug!("DISCOVERY | {pattern} not in flight, adding to task queue");
            if let Err(e) = self.tx.send(task) {
                error!("DISCOVERY | Failed to queue search for {pattern}: {e}");
                self.state.in_flight.remove(pattern);
            }
        }

        match self.state.results.get(pattern) {
            Some(result) => result.to_result(),
            None => Ok(Vec::new()),
        }
    }

    pub fn is_in_flight(&self, pattern: &str) -> bool {
        self.state.in_flight.contains_key(pattern)
    }

    /// Number of scans the worker has completed so far.
    pub fn completed_scans(&self) -> u64 {
        self.state.completed_scans.load(Ordering::Acquire)
    }
}

impl DiscoveryWorker {
    pub async fn run(mut self) {
        debug!("DISCOVERY | worker started");

        while let Some(task) = self.rx.recv().await {
            // staggers bursts of identical requests from many watchers
            sleep(jitter(self.config.max_jitter)).await;

            debug!("DISCOVERY | searching {}", task.pattern);
            let pattern = task.pattern.clone();
            let stale_after = self.config.stale_after;
            let scan = tokio::task::spawn_blocking(move || {
                discover(
                    &task.pattern,
                    &task.exclude_paths,
                    &task.suffixes,
                    stale_after,
                    SystemTime::now(),
                )
            })
            .await;

            let result = match scan {
                Ok(Ok(matches)) => DiscoveryResult {
                    matches,
                    error: None,
                },
                Ok(Err(e)) => {
                    error!("DISCOVERY | {e}");
                    DiscoveryResult {
                        matches: Vec::new(),
                        error: Some(e),
                    }
                }
                Err(e) => {
                    error!("DISCOVERY | Scan of {pattern} failed: {e}");
                    DiscoveryResult {
                        matches: Vec::new(),
                        error: Some(DiscoveryError::Scan(e.to_string())),
                    }
                }
            };
            debug!(
                "DISCOVERY | {pattern} resolved to {} paths",
                result.matches.len()
            );

            self.state.results.insert(pattern.clone(), Arc::new(result));
            self.state.completed_scans.fetch_add(1, Ordering::Release);
            self.state.in_flight.remove(&pattern);
        }

        debug!("DISCOVERY | worker stopped");
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(..max_ms))
}

/// Runs the whole pipeline for one pattern: expand, exclude, suffix filter, staleness.
pub fn discover(
    pattern: &str,
    exclude_paths: &[String],
    suffixes: &[String],
    stale_after: Duration,
    now: SystemTime,
) -> Result<Vec<PathBuf>, DiscoveryError> {
    let candidates = expand_glob(pattern)?;
    let candidates = drop_excluded(candidates, exclude_paths);
    let candidates = filter_suffix(candidates, suffixes);
    Ok(drop_stale(candidates, stale_after, now))
}

/// Expands `pattern`, `**` matching across directories. A trailing `**` matches everything
/// below its directory, files included. Entries that can't be read while walking are skipped.
pub fn expand_glob(pattern: &str) -> Result<Vec<PathBuf>, DiscoveryError> {
    let expanded = descend_trailing_wildcard(pattern);
    let paths = glob::glob(&expanded).map_err(|e| DiscoveryError::Pattern {
        pattern: pattern.to_string(),
        message: e.msg.to_string(),
    })?;
    Ok(paths
        .filter_map(|entry| match entry {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(
                    "DISCOVERY | Skipping unreadable path {}: {}",
                    e.path().display(),
                    e.error()
                );
                None
            }
        })
        .collect())
}

// `glob` yields only directories for a final `**` component
fn descend_trailing_wildcard(pattern: &str) -> Cow<'_, str> {
    if pattern == "**" || pattern.ends_with("/**") {
        Cow::Owned(format!("{pattern}/*"))
    } else {
        Cow::Borrowed(pattern)
    }
}

/// Drops every candidate matching at least one exclusion glob. Invalid globs match nothing.
pub fn drop_excluded(candidates: Vec<PathBuf>, exclude_paths: &[String]) -> Vec<PathBuf> {
    if exclude_paths.is_empty() {
        return candidates;
    }
    let patterns: Vec<Pattern> = exclude_paths
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                debug!("DISCOVERY | Ignoring invalid exclude pattern {p}: {e}");
                None
            }
        })
        .collect();
    candidates
        .into_iter()
        .filter(|c| {
            !patterns
                .iter()
                .any(|p| p.matches_path_with(c, EXCLUDE_MATCH_OPTIONS))
        })
        .collect()
}

/// Keeps candidates ending with one of `suffixes`; no suffixes keeps everything.
pub fn filter_suffix(candidates: Vec<PathBuf>, suffixes: &[String]) -> Vec<PathBuf> {
    if suffixes.is_empty() {
        return candidates;
    }
    candidates
        .into_iter()
        .filter(|c| {
            let path = c.to_string_lossy();
            suffixes.iter().any(|s| path.ends_with(s.as_str()))
        })
        .collect()
}

/// Drops candidates last modified more than `stale_after` before `now`, and candidates that
/// can't be stat'd.
pub fn drop_stale(candidates: Vec<PathBuf>, stale_after: Duration, now: SystemTime) -> Vec<PathBuf> {
    candidates
        .into_iter()
        .filter(|c| {
            let Ok(modified) = std::fs::metadata(c).and_then(|m| m.modified()) else {
                return false;
            };
            modified
                .checked_add(stale_after)
                .map_or(true, |fresh_until| fresh_until > now)
        })
        .collect()
}
