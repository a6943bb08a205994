// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stream admission policy.
//!
//! The policy file is a JSON document holding an allow-list and a block-list (label name to
//! regex), ordered filter cases and a default filter case. It is reloaded periodically and
//! swapped as a whole; callers evaluate against whichever complete snapshot is active.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::PolicyError;
use crate::refresh::{spawn_refresh_loop, FirstTick, Refresher};
use crate::LabelSet;

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDocument {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub allow_list: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub block_list: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub filter_options: Vec<FilterCase>,
    pub default_filter: FilterCase,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub tailing_compressed: bool,
    pub archived_format: Vec<String>,
}

/// Match criteria plus the path handling hints handed to path discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCase {
    /// Label the case matches on
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    /// Regex applied to the label value
    #[serde(skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub exclude_path: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suffix: Vec<String>,
}

#[derive(Debug)]
struct LabelMatcher {
    label: String,
    // None when the regex failed to compile, such an entry never matches
    pattern: Option<Regex>,
}

impl LabelMatcher {
    fn new(label: &str, pattern: &str) -> Self {
        LabelMatcher {
            label: label.to_string(),
            pattern: compile(label, pattern),
        }
    }

    // an absent label is matched as the empty string
    fn matches(&self, labels: &LabelSet) -> bool {
        let value = labels.get(&self.label).map_or("", String::as_str);
        self.pattern.as_ref().is_some_and(|p| p.is_match(value))
    }
}

fn compile(label: &str, pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            warn!("POLICY | Invalid regex {pattern:?} for label {label}, entry ignored: {e}");
            None
        }
    }
}

/// A policy document with its regexes compiled. Immutable once built.
#[derive(Debug)]
pub struct ActivePolicy {
    document: PolicyDocument,
    allow: Vec<LabelMatcher>,
    block: Vec<LabelMatcher>,
    filters: Vec<Option<Regex>>,
}

impl ActivePolicy {
    pub fn new(document: PolicyDocument) -> Self {
        let allow = document
            .allow_list
            .iter()
            .map(|(label, pattern)| LabelMatcher::new(label, pattern))
            .collect();
        let block = document
            .block_list
            .iter()
            .map(|(label, pattern)| LabelMatcher::new(label, pattern))
            .collect();
        let filters = document
            .filter_options
            .iter()
            .map(|case| compile(&case.key, &case.value))
            .collect();
        ActivePolicy {
            document,
            allow,
            block,
            filters,
        }
    }

    pub fn document(&self) -> &PolicyDocument {
        &self.document
    }

    /// Allowed unless an allow-list exists and nothing in it matches. Any block-list match
    /// denies, whatever the allow-list said.
    pub fn is_allowed(&self, labels: &LabelSet) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|m| m.matches(labels));
        allowed && !self.block.iter().any(|m| m.matches(labels))
    }

    /// First filter case whose key label is present and matches, else the default case.
    pub fn match_filter(&self, labels: &LabelSet) -> &FilterCase {
        self.document
            .filter_options
            .iter()
            .zip(&self.filters)
            .find(|(case, pattern)| match (labels.get(&case.key), pattern) {
                (Some(value), Some(pattern)) => pattern.is_match(value),
                _ => false,
            })
            .map_or(&self.document.default_filter, |(case, _)| case)
    }
}

/// Outcome of a successful reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reloaded {
    /// The file matches the active document, nothing was swapped
    Unchanged,
    /// A new document is now active
    Replaced,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub path: PathBuf,
    pub reload_interval: Duration,
}

impl PolicyConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        PolicyConfig {
            path: path.into(),
            reload_interval: DEFAULT_RELOAD_INTERVAL,
        }
    }
}

/// Hot-reloaded policy. Reads are a single atomic load of the active snapshot.
#[derive(Debug)]
pub struct PolicyStore {
    config: PolicyConfig,
    active: ArcSwap<ActivePolicy>,
}

impl PolicyStore {
    /// Creates the store and loads the policy file once, best effort. A missing or invalid
    /// file leaves the empty policy active, which allows everything.
    pub fn new(config: PolicyConfig) -> Self {
        let store = PolicyStore {
            config,
            active: ArcSwap::from_pointee(ActivePolicy::new(PolicyDocument::default())),
        };
        info!(
            "POLICY | Loading policy file {} at startup",
            store.config.path.display()
        );
        store.reload();
        store
    }

    /// Creates the store and spawns its reload loop.
    pub fn start(config: PolicyConfig) -> Arc<Self> {
        let store = Arc::new(Self::new(config));
        spawn_refresh_loop(
            Arc::clone(&store),
            store.config.reload_interval,
            FirstTick::AfterPeriod,
        );
        store
    }

    /// Reads and parses the policy file, swapping it in when it differs from the active one.
    pub fn reload_once(&self) -> Result<Reloaded, PolicyError> {
        self.install(&read_policy(&self.config.path)?)
    }

    fn install(&self, content: &[u8]) -> Result<Reloaded, PolicyError> {
        let document: PolicyDocument = serde_json::from_slice(content)?;

        if self.active.load().document == document {
            return Ok(Reloaded::Unchanged);
        }
        info!(
            "POLICY | Policy file updated, reloading: {}",
            String::from_utf8_lossy(content)
        );
        self.active.store(Arc::new(ActivePolicy::new(document)));
        info!("POLICY | Policy reload complete");
        Ok(Reloaded::Replaced)
    }

    fn reload(&self) {
        log_outcome(self.reload_once());
    }

    /// Active snapshot. Unchanged reloads keep returning the same `Arc`.
    pub fn snapshot(&self) -> Arc<ActivePolicy> {
        self.active.load_full()
    }

    pub fn is_allowed(&self, labels: &LabelSet) -> bool {
        self.active.load().is_allowed(labels)
    }

    pub fn match_filter(&self, labels: &LabelSet) -> FilterCase {
        let active = self.active.load();
        let case = active.match_filter(labels).clone();
        debug!("POLICY | Filter for {labels:?}: {case:?}");
        case
    }

    /// Whether compressed files should be tailed too
    pub fn tailing_compressed(&self) -> bool {
        self.active.load().document.tailing_compressed
    }

    /// Naming patterns of archived (rotated) files
    pub fn archived_format(&self) -> Vec<String> {
        self.active.load().document.archived_format.clone()
    }
}

#[async_trait]
impl Refresher for PolicyStore {
    fn name(&self) -> &'static str {
        "POLICY"
    }

    async fn refresh(&self) {
        let path = self.config.path.clone();
        match tokio::task::spawn_blocking(move || read_policy(&path)).await {
            Ok(read) => log_outcome(read.and_then(|content| self.install(&content))),
            Err(e) => warn!("POLICY | Policy file read task failed: {e}"),
        }
    }
}

fn read_policy(path: &Path) -> Result<Vec<u8>, PolicyError> {
    std::fs::read(path).map_err(|source| PolicyError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn log_outcome(outcome: Result<Reloaded, PolicyError>) {
    match outcome {
        Ok(_) => {}
        // a missing policy file is a normal state
        Err(e @ PolicyError::Read { .. }) => debug!("POLICY | {e}"),
        Err(e) => warn!("POLICY | Keeping current policy: {e}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tracing_test::traced_test;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn policy(json: &str) -> ActivePolicy {
        ActivePolicy::new(serde_json::from_str(json).unwrap())
    }

    fn write_policy(file: &NamedTempFile, json: &str) {
        std::fs::write(file.path(), json).unwrap();
    }

    #[test]
    fn test_parse_full_document() {
        let document: PolicyDocument = serde_json::from_str(
            r#"{
                "allow_list": {"app": "^pay"},
                "block_list": {"env": "test"},
                "filter_options": [
                    {"key": "app", "value": "^pay", "exclude_path": ["/data/logs/pay/tmp/*"], "suffix": [".log"]}
                ],
                "default_filter": {"suffix": [".log", ".out"]},
                "tailing_compressed": true,
                "archived_format": ["*.gz"]
            }"#,
        )
        .unwrap();
        assert_eq!(document.allow_list.get("app").unwrap(), "^pay");
        assert_eq!(document.filter_options[0].exclude_path, vec!["/data/logs/pay/tmp/*"]);
        assert_eq!(document.default_filter.suffix, vec![".log", ".out"]);
        assert!(document.tailing_compressed);
        assert_eq!(document.archived_format, vec!["*.gz"]);
    }

    #[test]
    fn test_no_allow_list_allows_by_default() {
        let policy = policy(r#"{"block_list": {"env": "^test$"}}"#);
        assert!(policy.is_allowed(&labels(&[("env", "prod")])));
        assert!(policy.is_allowed(&labels(&[])));
    }

    #[test]
    fn test_allow_list_requires_a_match() {
        let policy = policy(r#"{"allow_list": {"app": "^pay", "team": "core"}}"#);
        assert!(policy.is_allowed(&labels(&[("app", "payment")])));
        assert!(policy.is_allowed(&labels(&[("app", "other"), ("team", "core-infra")])));
        assert!(!policy.is_allowed(&labels(&[("app", "other")])));
        assert!(!policy.is_allowed(&labels(&[])));
    }

    #[test]
    fn test_block_list_overrides_allow_list() {
        let policy = policy(r#"{"allow_list": {"app": "^pay"}, "block_list": {"env": "^test$"}}"#);
        assert!(!policy.is_allowed(&labels(&[("app", "payment"), ("env", "test")])));
        assert!(policy.is_allowed(&labels(&[("app", "payment"), ("env", "prod")])));
    }

    #[test]
    fn test_missing_label_matches_as_empty_string() {
        let policy = policy(r#"{"block_list": {"app": "^$"}}"#);
        assert!(!policy.is_allowed(&labels(&[("env", "prod")])));
        assert!(policy.is_allowed(&labels(&[("app", "pay")])));
    }

    #[test]
    #[traced_test]
    fn test_invalid_regex_never_matches() {
        let policy = policy(r#"{"allow_list": {"app": "("}}"#);
        assert!(logs_contain("Invalid regex"));
        assert!(!policy.is_allowed(&labels(&[("app", "(")])));
    }

    #[test]
    fn test_first_matching_filter_wins() {
        let policy = policy(
            r#"{
                "filter_options": [
                    {"key": "app", "value": "^pay", "suffix": [".first"]},
                    {"key": "app", "value": "payment", "suffix": [".second"]}
                ],
                "default_filter": {"suffix": [".default"]}
            }"#,
        );
        assert_eq!(
            policy.match_filter(&labels(&[("app", "payment")])).suffix,
            vec![".first"]
        );
        assert_eq!(
            policy.match_filter(&labels(&[("app", "billing")])).suffix,
            vec![".default"]
        );
    }

    #[test]
    fn test_filter_requires_key_label_present() {
        let policy = policy(
            r#"{
                "filter_options": [{"key": "app", "value": ".*", "suffix": [".log"]}],
                "default_filter": {"suffix": [".default"]}
            }"#,
        );
        assert_eq!(
            policy.match_filter(&labels(&[("env", "prod")])).suffix,
            vec![".default"]
        );
        assert_eq!(
            policy.match_filter(&labels(&[("app", "")])).suffix,
            vec![".log"]
        );
    }

    #[test]
    #[traced_test]
    fn test_missing_file_keeps_empty_policy() {
        let store = PolicyStore::new(PolicyConfig::new("/nonexistent/shipper/acl.json"));
        assert!(store.is_allowed(&labels(&[("app", "pay")])));
        assert_eq!(store.match_filter(&labels(&[])), FilterCase::default());
        assert!(!store.tailing_compressed());
        assert!(logs_contain("Failed to read policy file"));
    }

    #[test]
    fn test_store_loads_at_startup() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"block_list": {"app": "^pay$"}, "tailing_compressed": true, "archived_format": ["*.gz"]}"#)
            .unwrap();

        let store = PolicyStore::new(PolicyConfig::new(file.path()));
        assert!(!store.is_allowed(&labels(&[("app", "pay")])));
        assert!(store.tailing_compressed());
        assert_eq!(store.archived_format(), vec!["*.gz"]);
    }

    #[test]
    fn test_reload_unchanged_keeps_identity() {
        let file = NamedTempFile::new().unwrap();
        write_policy(&file, r#"{"allow_list": {"app": "^pay"}}"#);
        let store = PolicyStore::new(PolicyConfig::new(file.path()));
        let before = store.snapshot();

        // same content, different formatting
        write_policy(&file, r#"{ "allow_list" : { "app" : "^pay" } }"#);
        assert_eq!(store.reload_once().unwrap(), Reloaded::Unchanged);
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[test]
    fn test_reload_changed_swaps_snapshot() {
        let file = NamedTempFile::new().unwrap();
        write_policy(&file, r#"{"allow_list": {"app": "^pay"}}"#);
        let store = PolicyStore::new(PolicyConfig::new(file.path()));
        let before = store.snapshot();
        assert!(!store.is_allowed(&labels(&[("app", "billing")])));

        write_policy(&file, r#"{"allow_list": {"app": "^billing"}}"#);
        assert_eq!(store.reload_once().unwrap(), Reloaded::Replaced);
        assert!(!Arc::ptr_eq(&before, &store.snapshot()));
        assert_eq!(
            store.snapshot().document().allow_list.get("app").unwrap(),
            "^billing"
        );
        assert!(store.is_allowed(&labels(&[("app", "billing")])));
        // the old snapshot is untouched
        assert!(!before.is_allowed(&labels(&[("app", "billing")])));
    }

    #[test]
    #[traced_test]
    fn test_invalid_file_keeps_previous_policy() {
        let file = NamedTempFile::new().unwrap();
        write_policy(&file, r#"{"block_list": {"app": "^pay$"}}"#);
        let store = PolicyStore::new(PolicyConfig::new(file.path()));
        let before = store.snapshot();

        write_policy(&file, r#"{"block_list": "#);
        assert!(matches!(store.reload_once(), Err(PolicyError::Parse(_))));
        store.reload();
        assert!(logs_contain("Keeping current policy"));
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
        assert!(!store.is_allowed(&labels(&[("app", "pay")])));
    }

    #[tokio::test]
    async fn test_periodic_refresh_swaps_changed_file() {
        let file = NamedTempFile::new().unwrap();
        write_policy(&file, r#"{"allow_list": {"app": "^pay"}}"#);
        let store = PolicyStore::new(PolicyConfig::new(file.path()));
        let before = store.snapshot();

        store.refresh().await;
        assert!(Arc::ptr_eq(&before, &store.snapshot()));

        write_policy(&file, r#"{"allow_list": {"app": "^billing"}, "tailing_compressed": true}"#);
        store.refresh().await;
        assert!(store.is_allowed(&labels(&[("app", "billing")])));
        assert!(store.tailing_compressed());
        // the previous snapshot keeps its own document
        let expected = PolicyDocument {
            allow_list: BTreeMap::from([("app".to_string(), "^pay".to_string())]),
            ..PolicyDocument::default()
        };
        assert_eq!(before.document(), &expected);
    }
}
