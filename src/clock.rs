// SPDX-License-Identifier: Apache-2.0
//! Injected clock, so snapshot timestamps are never read from a hidden
//! global (see spec's `currentGmtTimeStrFunc` open question).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of "now", plus the uniqueness-guaranteeing delay used by
/// `BackupSnapshot::create_current`.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now_gmt(&self) -> DateTime<Utc>;

    /// Called before stamping a freshly created snapshot, to guarantee two
    /// calls in quick succession never produce the same timestamp.
    async fn wait_for_unique_tick(&self);
}

/// Real wall-clock time; sleeps two seconds per spec's minimum-resolution
/// requirement.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_gmt(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn wait_for_unique_tick(&self) {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

/// Deterministic clock for tests: each call to `now_gmt` advances by one
/// synthetic second from a fixed start, and `wait_for_unique_tick` never
/// actually sleeps (the monotonic tick already guarantees uniqueness).
pub struct TestClock {
    start: i64,
    ticks: AtomicI64,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        TestClock {
            start: start.timestamp(),
            ticks: AtomicI64::new(0),
        }
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now_gmt(&self) -> DateTime<Utc> {
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst);
        DateTime::from_timestamp(self.start + tick, 0).expect("valid timestamp")
    }

    async fn wait_for_unique_tick(&self) {
        // The monotonically increasing tick above already guarantees
        // uniqueness; no real delay needed in tests.
    }
}
