// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! An injectable clock so the timing-sensitive scheduling scenarios in the
//! dispatch core can be driven deterministically in tests instead of racing
//! the wall clock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// A source of "now", expressed in milliseconds.
///
/// Implementations must be cheap to call repeatedly and safe to share across
/// tasks; `DeadlineAwareQueue` calls `now_ms()` on every eligibility check.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> i64;
}

/// Wall-clock time, matching the millisecond-since-epoch timestamps the
/// Python prototype derives from `time.time() * 1000`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_millis() as i64
    }
}

#[derive(Debug)]
struct ManualClockInner {
    now_ms: AtomicI64,
    notify: Notify,
}

/// A manually-advanceable clock for deterministic tests. Cloning shares the
/// same underlying time; `advance`/`set` wake anything suspended on
/// `notified()`.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualClockInner>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            inner: Arc::new(ManualClockInner {
                now_ms: AtomicI64::new(start_ms),
                notify: Notify::new(),
            }),
        }
    }

    pub fn advance(&self, delta_ms: i64) {
        self.inner.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn set(&self, at_ms: i64) {
        self.inner.now_ms.store(at_ms, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Resolves the next time `advance`/`set` is called. Exposed for tests
    /// that want to synchronize with a task blocked on the clock rather than
    /// sleeping a real wall-clock interval.
    pub async fn notified(&self) {
        self.inner.notify.notified().await;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.inner.now_ms.load(Ordering::SeqCst)
    }
}
