// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Background refresh skeleton shared by the endpoint selector and the policy store.
//!
//! A refresher owns a snapshot that callers read without locking. The loop spawned here only
//! decides *when* to refresh; each refresher decides how to fetch, how to log failures, and
//! when to publish a new snapshot.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

#[async_trait]
pub trait Refresher: Send + Sync + 'static {
    /// Short component name used in log lines.
    fn name(&self) -> &'static str;

    /// Performs one refresh cycle. Failures are handled (and logged) by the implementor, the
    /// previous snapshot stays in place.
    async fn refresh(&self);
}

/// When the first refresh of a loop happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstTick {
    /// Refresh as soon as the loop starts.
    Immediate,
    /// Wait one full period, the caller already loaded an initial snapshot.
    AfterPeriod,
}

/// Spawns a task that calls `refresher.refresh()` every `period` for the life of the process.
///
/// A slow refresh delays the following ticks instead of bursting to catch up.
pub fn spawn_refresh_loop<R: Refresher>(
    refresher: Arc<R>,
    period: Duration,
    first_tick: FirstTick,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(
            "{} | refresh loop started, period {:?}",
            refresher.name(),
            period
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if first_tick == FirstTick::AfterPeriod {
            // first tick of an interval is instantaneous
            ticker.tick().await;
        }
        loop {
            ticker.tick().await;
            refresher.refresh().await;
        }
    })
}
