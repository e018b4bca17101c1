//! Minute-by-minute reminder firing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use crate::bot::database::{ReminderStore, StoreError};
use crate::bot::message::{Reply, format_arrivals};
use crate::bot::reminders::Reminder;
use crate::bot::transit::{TransitData, TransitError};

/// How far back a late tick looks for minutes it missed.
const MAX_CATCH_UP_MINUTES: i64 = 5;

/// Outbound side of the chat platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat_id: i64, reply: &Reply) -> Result<(), String>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    /// Due but not delivered (transit failure, timeout or send failure).
    pub skipped: usize,
}

#[derive(Default)]
struct TickState {
    /// Last local minute a scan completed for.
    last_minute: Option<NaiveDateTime>,
    /// reminder id -> local minute it last fired for.
    last_fired: HashMap<i64, NaiveDateTime>,
}

pub struct Scheduler {
    store: Arc<ReminderStore>,
    transit: Arc<TransitData>,
    messenger: Arc<dyn Messenger>,
    tz: Tz,
    fetch_timeout: Duration,
    state: Mutex<TickState>,
}

impl Scheduler {
    pub fn new(
        store: Arc<ReminderStore>,
        transit: Arc<TransitData>,
        messenger: Arc<dyn Messenger>,
        tz: Tz,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transit,
            messenger,
            tz,
            fetch_timeout,
            state: Mutex::new(TickState::default()),
        }
    }

    /// Run [`Scheduler::tick`] every `period` on a background task.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = Utc::now().with_timezone(&self.tz);
                match self.tick(now).await {
                    Ok(report) if report.fired + report.skipped > 0 => {
                        info!("Reminder tick: {} fired, {} skipped", report.fired, report.skipped);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Reminder check failed, retrying next tick: {}", e),
                }
            }
        })
    }

    /// Fire every reminder due between the previous tick and `now`.
    ///
    /// A store failure aborts the tick without advancing, so the next tick
    /// covers the same minutes.
    pub async fn tick(&self, now: DateTime<Tz>) -> Result<TickReport, StoreError> {
        let mut state = self.state.lock().await;
        let current = truncate_to_minute(now.naive_local());
        let window = due_window(state.last_minute, current);
        if window.is_empty() {
            debug!("Minute {} already scanned", current);
            return Ok(TickReport::default());
        }

        let reminders = self.store.scan_all()?;
        state.last_minute = Some(current);

        let live: HashSet<i64> = reminders.iter().map(|r| r.id).collect();
        state.last_fired.retain(|id, _| live.contains(id));

        let now_utc = now.with_timezone(&Utc);
        let mut report = TickReport::default();
        for reminder in &reminders {
            let Some(minute) = window.iter().rev().copied().find(|m| reminder.is_due_at(*m)) else {
                continue;
            };
            if state
                .last_fired
                .get(&reminder.id)
                .is_some_and(|last| *last >= minute)
            {
                continue;
            }
            state.last_fired.insert(reminder.id, minute);

            if self.fire(reminder, now_utc).await {
                report.fired += 1;
            } else {
                report.skipped += 1;
            }
        }

        Ok(report)
    }

    async fn fire(&self, reminder: &Reminder, now: DateTime<Utc>) -> bool {
        let lookup = self
            .transit
            .get_arrivals(&reminder.service_no, &reminder.stop_code);
        let arrivals = match timeout(self.fetch_timeout, lookup).await {
            Ok(Ok(arrivals)) => arrivals,
            Ok(Err(TransitError::NotFound)) => Vec::new(),
            Ok(Err(TransitError::UpstreamUnavailable(e))) => {
                warn!(
                    "Skipping reminder {} (bus {} at {}): {}",
                    reminder.id, reminder.service_no, reminder.stop_code, e
                );
                return false;
            }
            Err(_) => {
                warn!(
                    "Skipping reminder {}: arrival lookup timed out after {:?}",
                    reminder.id, self.fetch_timeout
                );
                return false;
            }
        };

        let text = format_arrivals(
            &reminder.service_no,
            &reminder.stop_name,
            &reminder.stop_code,
            &arrivals,
            now,
        );
        match self.messenger.send(reminder.owner_id, &Reply::text(text)).await {
            Ok(()) => {
                info!(
                    "Sent reminder #{} to {} (bus {}, {} arrival(s))",
                    reminder.seq,
                    reminder.owner_id,
                    reminder.service_no,
                    arrivals.len()
                );
                true
            }
            Err(e) => {
                warn!("Failed to send reminder {} to {}: {}", reminder.id, reminder.owner_id, e);
                false
            }
        }
    }
}

fn truncate_to_minute(local: NaiveDateTime) -> NaiveDateTime {
    let time = local.time();
    local
        .date()
        .and_hms_opt(time.hour(), time.minute(), 0)
        .unwrap_or(local)
}

/// Minutes after `previous` up to and including `current`, at most
/// [`MAX_CATCH_UP_MINUTES`] of them. Empty when `current` was already seen.
fn due_window(previous: Option<NaiveDateTime>, current: NaiveDateTime) -> Vec<NaiveDateTime> {
    let earliest = current - TimeDelta::minutes(MAX_CATCH_UP_MINUTES - 1);
    let mut minute = match previous {
        Some(prev) => (prev + TimeDelta::minutes(1)).max(earliest),
        None => current,
    };

    let mut window = Vec::new();
    while minute <= current {
        window.push(minute);
        minute += TimeDelta::minutes(1);
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Asia::Singapore;

    use crate::bot::reminders::{DaysMode, NewReminder, TriggerTime};
    use crate::bot::testing::{FakeTransit, RecordingMessenger};
    use crate::bot::transit::CacheSettings;

    struct Harness {
        store: Arc<ReminderStore>,
        fake: Arc<FakeTransit>,
        messenger: Arc<RecordingMessenger>,
        scheduler: Scheduler,
    }

    fn harness() -> Harness {
        let store = Arc::new(ReminderStore::in_memory().unwrap());
        let fake = Arc::new(FakeTransit::sample());
        let transit = Arc::new(TransitData::new(fake.clone(), CacheSettings::default()));
        let messenger = Arc::new(RecordingMessenger::default());
        let scheduler = Scheduler::new(
            store.clone(),
            transit,
            messenger.clone(),
            Singapore,
            Duration::from_millis(100),
        );
        Harness { store, fake, messenger, scheduler }
    }

    fn add(store: &ReminderStore, owner_id: i64, stop_code: &str, days: DaysMode, hour: u8, minute: u8) {
        store
            .create(&NewReminder {
                owner_id,
                service_no: "965".to_string(),
                stop_code: stop_code.to_string(),
                stop_name: "Blk 123".to_string(),
                days,
                time: TriggerTime::new(hour, minute).unwrap(),
            })
            .unwrap();
    }

    /// Singapore local time in October 2026 (the 14th is a Wednesday).
    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Tz> {
        Singapore
            .with_ymd_and_hms(2026, 10, day, hour, minute, second)
            .unwrap()
    }

    #[tokio::test]
    async fn test_wednesday_fires_matching_minute_only() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Weekdays, 8, 0);
        add(&h.store, 2, "83139", DaysMode::Daily, 8, 0);
        add(&h.store, 3, "83139", DaysMode::Weekdays, 8, 1);
        let now = at(14, 8, 0, 5);
        h.fake.set_arrivals("83139", "965", vec![FakeTransit::arrival(now.with_timezone(&Utc), 4)]);

        let report = h.scheduler.tick(now).await.unwrap();
        assert_eq!(report, TickReport { fired: 2, skipped: 0 });
        assert_eq!(h.messenger.sent_to(1).len(), 1);
        assert_eq!(h.messenger.sent_to(2).len(), 1);
        assert!(h.messenger.sent_to(3).is_empty());
        assert!(h.messenger.sent_to(1)[0].contains("Next bus: <b>4 min</b>"));
    }

    #[tokio::test]
    async fn test_weekend_skips_weekday_reminders() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Weekdays, 8, 0);
        add(&h.store, 2, "83139", DaysMode::Daily, 8, 0);

        h.scheduler.tick(at(17, 8, 0, 0)).await.unwrap();
        assert!(h.messenger.sent_to(1).is_empty());
        assert_eq!(h.messenger.sent_to(2).len(), 1);
    }

    #[tokio::test]
    async fn test_same_minute_does_not_fire_twice() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 8, 0);

        h.scheduler.tick(at(14, 8, 0, 1)).await.unwrap();
        let again = h.scheduler.tick(at(14, 8, 0, 45)).await.unwrap();
        assert_eq!(again, TickReport::default());
        assert_eq!(h.messenger.sent_to(1).len(), 1);
    }

    #[tokio::test]
    async fn test_fires_again_next_day() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 8, 0);

        h.scheduler.tick(at(14, 8, 0, 0)).await.unwrap();
        h.scheduler.tick(at(14, 8, 1, 0)).await.unwrap();
        h.scheduler.tick(at(15, 8, 0, 0)).await.unwrap();
        assert_eq!(h.messenger.sent_to(1).len(), 2);
    }

    #[tokio::test]
    async fn test_late_tick_catches_up() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 8, 0);

        h.scheduler.tick(at(14, 7, 59, 0)).await.unwrap();
        // The 08:00 and 08:01 ticks never ran
        let report = h.scheduler.tick(at(14, 8, 2, 10)).await.unwrap();
        assert_eq!(report.fired, 1);
        assert_eq!(h.messenger.sent_to(1).len(), 1);
    }

    #[tokio::test]
    async fn test_catch_up_is_bounded() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 8, 0);

        h.scheduler.tick(at(14, 7, 0, 0)).await.unwrap();
        h.scheduler.tick(at(14, 8, 10, 0)).await.unwrap();
        assert!(h.messenger.sent_to(1).is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_isolated() {
        let h = harness();
        add(&h.store, 1, "46009", DaysMode::Daily, 8, 0);
        add(&h.store, 2, "83139", DaysMode::Daily, 8, 0);
        h.fake.fail_stop("46009");

        let report = h.scheduler.tick(at(14, 8, 0, 0)).await.unwrap();
        assert_eq!(report, TickReport { fired: 1, skipped: 1 });
        assert!(h.messenger.sent_to(1).is_empty());
        assert_eq!(h.messenger.sent_to(2).len(), 1);
    }

    #[tokio::test]
    async fn test_slow_lookup_times_out() {
        let h = harness();
        add(&h.store, 1, "46009", DaysMode::Daily, 8, 0);
        add(&h.store, 2, "83139", DaysMode::Daily, 8, 0);
        h.fake.hang_stop("46009");

        let report = h.scheduler.tick(at(14, 8, 0, 0)).await.unwrap();
        assert_eq!(report, TickReport { fired: 1, skipped: 1 });
        assert_eq!(h.messenger.sent_to(2).len(), 1);
    }

    #[tokio::test]
    async fn test_no_buses_still_notifies() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 23, 59);

        h.scheduler.tick(at(14, 23, 59, 0)).await.unwrap();
        let sent = h.messenger.sent_to(1);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("No arrival data available"));
        assert_eq!(h.fake.arrival_calls(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_does_not_block_others() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 8, 0);
        add(&h.store, 2, "83139", DaysMode::Daily, 8, 0);
        h.messenger.fail_chat(1);

        let report = h.scheduler.tick(at(14, 8, 0, 0)).await.unwrap();
        assert_eq!(report, TickReport { fired: 1, skipped: 1 });
        assert_eq!(h.messenger.sent_to(2).len(), 1);
    }

    #[tokio::test]
    async fn test_deleted_reminder_stops_firing() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 8, 0);

        h.scheduler.tick(at(14, 8, 0, 0)).await.unwrap();
        h.store.delete(1, 1).unwrap();
        h.scheduler.tick(at(15, 8, 0, 0)).await.unwrap();
        assert_eq!(h.messenger.sent_to(1).len(), 1);
    }

    #[tokio::test]
    async fn test_failed_scan_is_retried_next_tick() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 8, 0);

        h.scheduler.tick(at(14, 7, 59, 0)).await.unwrap();
        h.store
            .execute_sql("ALTER TABLE bus_reminders RENAME TO bus_reminders_parked")
            .unwrap();
        assert!(h.scheduler.tick(at(14, 8, 0, 0)).await.is_err());
        assert!(h.messenger.sent_to(1).is_empty());

        h.store
            .execute_sql("ALTER TABLE bus_reminders_parked RENAME TO bus_reminders")
            .unwrap();
        let report = h.scheduler.tick(at(14, 8, 1, 0)).await.unwrap();
        assert_eq!(report, TickReport { fired: 1, skipped: 0 });
        h.scheduler.tick(at(14, 8, 2, 0)).await.unwrap();
        assert_eq!(h.messenger.sent_to(1).len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_row_does_not_block_others() {
        let h = harness();
        add(&h.store, 1, "83139", DaysMode::Daily, 8, 0);
        add(&h.store, 2, "83139", DaysMode::Daily, 8, 0);
        h.store
            .execute_sql("UPDATE bus_reminders SET days = 'fortnightly' WHERE owner_id = 1")
            .unwrap();

        let report = h.scheduler.tick(at(14, 8, 0, 0)).await.unwrap();
        assert_eq!(report, TickReport { fired: 1, skipped: 0 });
        assert!(h.messenger.sent_to(1).is_empty());
        assert_eq!(h.messenger.sent_to(2).len(), 1);
    }

    #[test]
    fn test_due_window() {
        let m = |hour: u32, minute: u32| at(14, hour, minute, 0).naive_local();

        assert_eq!(due_window(None, m(8, 0)), vec![m(8, 0)]);
        assert!(due_window(Some(m(8, 0)), m(8, 0)).is_empty());
        assert_eq!(due_window(Some(m(7, 58)), m(8, 0)), vec![m(7, 59), m(8, 0)]);
        assert_eq!(due_window(Some(m(6, 0)), m(8, 0)).len(), MAX_CATCH_UP_MINUTES as usize);
        // Clock moved backwards
        assert!(due_window(Some(m(8, 5)), m(8, 0)).is_empty());
    }

    #[test]
    fn test_truncate_to_minute() {
        let local = at(14, 8, 0, 59).naive_local();
        assert_eq!(truncate_to_minute(local), at(14, 8, 0, 0).naive_local());
    }
}
