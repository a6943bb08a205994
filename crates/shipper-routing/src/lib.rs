// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic refresh-and-select layer of the log shipping agent.
//!
//! Three independent components share one skeleton: a background task refreshes a piece of
//! shared state from a slow external source, and callers read a consistent snapshot of it
//! without ever waiting on the refresh.
//!
//! - [`endpoint::EndpointSelector`]: collector endpoints from a directory service, handed out
//!   round-robin.
//! - [`policy::PolicyStore`]: hot-reloaded allow/block lists and filter cases for labeled
//!   streams.
//! - [`discovery::PathDiscoveryCache`]: glob expansion with request coalescing, exclusion and
//!   suffix filtering, and staleness pruning.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod errors;
pub mod http;
pub mod policy;
pub mod refresh;

/// Label name to label value, as attached to a log stream by the scrape pipeline.
pub type LabelSet = std::collections::HashMap<String, String>;
