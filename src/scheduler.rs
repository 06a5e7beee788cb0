//! Debounced, single-flight tidy trigger.
//!
//! Every data-plane call triggers this; the common case (tidy already ran
//! recently) must be lock-free, so state lives in two atomics rather than a
//! state enum behind a mutex.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::CacheInner;
use crate::prelude::*;

const HOLD_OFF: Duration = Duration::from_secs(10);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) struct TidyScheduler {
    /// 0 = idle, 1 = a tidy pass owns the right to run (or is about to).
    /// Values above 1 mean other triggers arrived while a pass was already
    /// in flight; they all bail without running anything.
    inflight: AtomicU64,
    /// Millis-since-epoch before which new triggers are dropped.
    hold_off_until: AtomicU64,
}

impl TidyScheduler {
    pub fn new() -> TidyScheduler {
        TidyScheduler {
            inflight: AtomicU64::new(0),
            hold_off_until: AtomicU64::new(0),
        }
    }

    /// Called from every `read_at`/`block_read`/`block_write`. Never blocks
    /// and never returns an error; tidy runs (if it runs at all) in a
    /// detached background task.
    pub fn trigger(inner: &Arc<CacheInner>) {
        let scheduler = &inner.scheduler;
        let n = scheduler.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        if n != 1 {
            scheduler.inflight.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        if now_millis() < scheduler.hold_off_until.load(Ordering::SeqCst) {
            scheduler.inflight.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let inner = inner.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::tidy::run(&inner).await {
                warn!("tidy pass failed: {e:#}");
            }
            inner
                .scheduler
                .hold_off_until
                .store(now_millis() + HOLD_OFF.as_millis() as u64, Ordering::SeqCst);
            inner.scheduler.inflight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::Cache;
    use crate::config::Config;
    use crate::test_util::MemoryGateway;
    use std::sync::Arc;

    #[tokio::test]
    async fn second_trigger_within_holdoff_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = Arc::new(MemoryGateway::new());
        let config = Config::new(dir.path());
        let cache = Cache::new(config, upstream).await.unwrap();

        TidyScheduler::trigger(cache.inner());
        // Give the first pass a chance to run and set the hold-off deadline.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let deadline_after_first = cache
            .inner()
            .scheduler
            .hold_off_until
            .load(Ordering::SeqCst);
        assert!(deadline_after_first > 0);

        TidyScheduler::trigger(cache.inner());
        tokio::time::sleep(Duration::from_millis(10)).await;
        let deadline_after_second = cache
            .inner()
            .scheduler
            .hold_off_until
            .load(Ordering::SeqCst);
        assert_eq!(deadline_after_first, deadline_after_second);
    }
}
