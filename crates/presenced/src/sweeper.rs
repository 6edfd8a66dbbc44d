//! Daily absentee sweep.

use crate::gate::{Clock, TimeWindow};
use crate::store::{timed, AttendanceLedger, StoreError, UserDirectory};
use chrono::{DateTime, FixedOffset};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub const DEFAULT_SCHEDULE: &str = "0 1 9 * * *";

/// Parse a six-field (seconds-first) cron expression.
pub fn parse_schedule(expr: &str) -> Result<Schedule, cron::error::Error> {
    Schedule::from_str(expr.trim())
}

/// Next fire time strictly after both `now` and the previous fire.
///
/// A wall clock lagging the tokio timer can wake us just before the slot we
/// slept for; anchoring on `last` keeps that slot from firing twice.
pub fn next_fire(
    schedule: &Schedule,
    now: DateTime<FixedOffset>,
    last: Option<DateTime<FixedOffset>>,
) -> Option<DateTime<FixedOffset>> {
    let from = last.map_or(now, |last| now.max(last));
    schedule.after(&from).next()
}

/// Users marked absent by one sweep, in write order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub absent: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Sweeper {
    users: Arc<dyn UserDirectory>,
    ledger: Arc<dyn AttendanceLedger>,
    clock: Arc<dyn Clock>,
    window: TimeWindow,
    store_timeout: Duration,
    writer: Arc<Mutex<()>>,
}

impl Sweeper {
    pub fn new(
        users: Arc<dyn UserDirectory>,
        ledger: Arc<dyn AttendanceLedger>,
        clock: Arc<dyn Clock>,
        window: TimeWindow,
        store_timeout: Duration,
        writer: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            users,
            ledger,
            clock,
            window,
            store_timeout,
            writer,
        }
    }

    /// Write an absent record for every user without a present record today.
    ///
    /// Holds the writer lock for the whole read-then-write. Running twice in a
    /// day writes the absences twice.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let _guard = self.writer.lock().await;
        let now = self.clock.now();
        let since = self.window.start_of_day(now);

        let all: BTreeSet<String> = timed(self.store_timeout, self.users.all_user_ids())
            .await?
            .into_iter()
            .collect();
        let present = timed(self.store_timeout, self.ledger.list_present_since(since)).await?;

        let mut report = SweepReport::default();
        for user_id in all.into_iter().filter(|id| !present.contains(id)) {
            match timed(self.store_timeout, self.ledger.write_absent(&user_id, now)).await {
                Ok(_) => report.absent.push(user_id),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "absent write failed");
                    report.failed.push(user_id);
                }
            }
        }

        tracing::info!(
            since = %since,
            present = present.len(),
            absent = report.absent.len(),
            failed = report.failed.len(),
            "absentee sweep finished"
        );
        Ok(report)
    }

    /// Run [`Self::sweep_once`] at every fire time of `schedule`, evaluated in
    /// the window's fixed timezone. Failures are logged and the run dropped.
    pub fn spawn(self: Arc<Self>, schedule: Schedule) -> JoinHandle<()> {
        tokio::spawn(async move {
            let tz = self.window.offset();
            let mut last = None;
            loop {
                let now = self.clock.now().with_timezone(&tz);
                let Some(next) = next_fire(&schedule, now, last) else {
                    tracing::warn!("sweep schedule has no future fire times; sweeper stopping");
                    return;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tracing::info!(next = %next, "next absentee sweep scheduled");
                tokio::time::sleep(wait).await;
                last = Some(next);

                if let Err(e) = self.sweep_once().await {
                    tracing::error!(error = %e, "absentee sweep failed");
                }
            }
        })
    }
}
