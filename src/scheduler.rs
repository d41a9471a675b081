//! In-process daily trigger for the update pipeline.

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use std::future::Future;
use tracing::info;

/// A fixed UTC wall-clock time, once per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailySchedule {
    at: NaiveTime,
}

impl DailySchedule {
    pub fn new(hour_utc: u32, minute_utc: u32) -> Result<Self> {
        let at = NaiveTime::from_hms_opt(hour_utc, minute_utc, 0)
            .ok_or_else(|| anyhow!("invalid schedule time {hour_utc:02}:{minute_utc:02}"))?;
        Ok(Self { at })
    }

    /// First scheduled instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.at).and_utc();
        if today > now {
            today
        } else {
            today + TimeDelta::days(1)
        }
    }
}

/// Runs `job` at every scheduled time until `shutdown` resolves. A failed run
/// is not retried before the next scheduled time; `job` reports its own outcome.
pub async fn run_daily<F, Fut, S>(
    schedule: DailySchedule,
    run_immediately: bool,
    shutdown: S,
    mut job: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
    S: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    if run_immediately {
        info!("daemon: running update immediately");
        job().await;
    }

    loop {
        let now = Utc::now();
        let next = schedule.next_after(now);
        let wait = (next - now).to_std().unwrap_or_default();
        info!(next_run = %next, wait_secs = wait.as_secs(), "daemon: waiting for next run");

        tokio::select! {
            _ = &mut shutdown => {
                info!("daemon: shutdown requested");
                return Ok(());
            }
            _ = tokio::time::sleep(wait) => {}
        }

        job().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn later_today_when_before_trigger() {
        let s = DailySchedule::new(8, 0).unwrap();
        assert_eq!(s.next_after(at(2024, 3, 1, 7, 59, 59)), at(2024, 3, 1, 8, 0, 0));
    }

    #[test]
    fn tomorrow_when_at_or_past_trigger() {
        let s = DailySchedule::new(8, 0).unwrap();
        assert_eq!(s.next_after(at(2024, 3, 1, 8, 0, 0)), at(2024, 3, 2, 8, 0, 0));
        assert_eq!(s.next_after(at(2024, 2, 29, 23, 0, 0)), at(2024, 3, 1, 8, 0, 0));
        assert_eq!(s.next_after(at(2023, 12, 31, 9, 30, 0)), at(2024, 1, 1, 8, 0, 0));
    }

    #[test]
    fn rejects_invalid_time() {
        assert!(DailySchedule::new(24, 0).is_err());
        assert!(DailySchedule::new(8, 60).is_err());
    }

    #[tokio::test]
    async fn immediate_run_then_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut tx = Some(tx);

        let counter = runs.clone();
        run_daily(
            DailySchedule::new(8, 0).unwrap(),
            true,
            async move {
                let _ = rx.await;
            },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = tx.take() {
                    let _ = tx.send(());
                }
                async {}
            },
        )
        .await
        .unwrap();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
