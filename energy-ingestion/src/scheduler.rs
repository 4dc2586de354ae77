//! Wall-clock aligned periodic ticks (e.g. every hour at minute five).

use std::future::Future;

use time::{Duration, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::config::AggregationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    period_secs: i64,
    offset_secs: i64,
}

impl Schedule {
    pub fn new(period_secs: u64, offset_secs: u64) -> Self {
        let period_secs = i64::try_from(period_secs.max(1)).unwrap_or(i64::MAX);
        let offset_secs = i64::try_from(offset_secs).unwrap_or(0) % period_secs;
        Self {
            period_secs,
            offset_secs,
        }
    }

    pub fn from_config(cfg: &AggregationConfig) -> Self {
        Self::new(cfg.period_secs, cfg.offset_secs)
    }

    /// The first tick strictly after `now`. Ticks fall on whole UTC seconds
    /// where `(unix_time - offset) % period == 0`.
    pub fn next_tick_after(&self, now: OffsetDateTime) -> OffsetDateTime {
        let secs = now.unix_timestamp();
        let k = (secs - self.offset_secs).div_euclid(self.period_secs);
        let mut next = self.offset_secs + k * self.period_secs;
        if next <= secs {
            next += self.period_secs;
        }
        let whole = now - Duration::nanoseconds(i64::from(now.nanosecond()));
        whole + Duration::seconds(next - secs)
    }
}

/// Call `job` at every tick until `shutdown` fires. A job runs to completion
/// before the next tick is computed, so ticks never overlap.
pub async fn run<F, Fut>(schedule: Schedule, shutdown: CancellationToken, mut job: F)
where
    F: FnMut(OffsetDateTime) -> Fut,
    Fut: Future<Output = ()>,
{
    loop {
        let now = OffsetDateTime::now_utc();
        let tick = schedule.next_tick_after(now);
        let wait = std::time::Duration::try_from(tick - now).unwrap_or_default();
        tracing::debug!(%tick, "next scheduled tick");

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => job(tick).await,
        }
    }
    tracing::info!("scheduler stopped");
}
