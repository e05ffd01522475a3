//! Digest scheduler background loop.
//!
//! Spawns a tokio task that periodically sends every due standup digest
//! and hands it to the delivery callback. Failed deliveries stay pending in
//! the store and are retried on later ticks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::model::{PostId, StandupId};
use crate::standup::DigestPayload;
use crate::store::SqliteStandupStore;
use crate::timezone::Clock;

/// Callback that hands a digest to the mailer.
pub type DeliveryFn = Box<dyn Fn(&DigestPayload) -> Result<()> + Send + Sync>;

/// Something the scheduler did, reported on the event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestEvent {
    /// A digest was recorded as sent.
    Sent(DigestPayload),
    /// The mailer accepted a digest.
    Delivered {
        /// Post whose digest went out.
        post_id: PostId,
    },
    /// The mailer rejected a digest; retried while attempts remain.
    DeliveryFailed {
        /// Post whose digest was rejected.
        post_id: PostId,
        /// Mailer error text.
        error: String,
    },
    /// A standup could not be evaluated, e.g. its stored zone is corrupt.
    StandupFailed {
        /// Standup that was skipped.
        standup_id: StandupId,
        /// Why it was skipped.
        error: String,
    },
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Digests sent.
    pub sent: usize,
    /// Deliveries that succeeded.
    pub delivered: usize,
    /// Deliveries that failed.
    pub failed: usize,
}

/// Background scheduler that sends due digests.
pub struct DigestScheduler {
    store: Arc<SqliteStandupStore>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// Delivery callback; without one sent digests stay pending.
    delivery: Option<DeliveryFn>,
    /// Optional channel for reporting events to a front end.
    events: Option<mpsc::UnboundedSender<DigestEvent>>,
}

impl DigestScheduler {
    /// Create a scheduler over `store`, reading time from `clock`.
    pub fn new(
        store: Arc<SqliteStandupStore>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            delivery: None,
            events: None,
        }
    }

    /// Set the delivery callback.
    pub fn with_delivery(mut self, delivery: DeliveryFn) -> Self {
        self.delivery = Some(delivery);
        self
    }

    /// Report events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<DigestEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Start the loop. Stops when `cancel` fires.
    pub fn run(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.tick_interval_secs.max(1));
            info!("digest scheduler started, ticking every {}s", period.as_secs());
            let mut interval = tokio::time::interval(period);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("digest scheduler stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.tick() {
                            error!("digest scheduler tick failed: {e}");
                        }
                    }
                }
            }
        })
    }

    /// Run one pass: send every due digest, then deliver pending posts.
    pub fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        let mut fresh: HashMap<PostId, DigestPayload> = HashMap::new();

        for standup in self.store.list_standups()? {
            match self.store.send_digest(standup.id, self.clock.as_ref()) {
                Ok(Some(payload)) => {
                    report.sent += 1;
                    if let Some(post_id) = payload.post_id {
                        fresh.insert(post_id, payload.clone());
                    }
                    self.emit(DigestEvent::Sent(payload));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(standup_id = standup.id, "skipping standup: {e}");
                    self.emit(DigestEvent::StandupFailed {
                        standup_id: standup.id,
                        error: e.to_string(),
                    });
                }
            }
        }

        let Some(deliver) = self.delivery.as_ref() else {
            if report.sent > 0 {
                debug!("no delivery callback; {} digests left pending", report.sent);
            }
            return Ok(report);
        };

        for pending in self
            .store
            .pending_deliveries(self.config.max_delivery_attempts)?
        {
            let payload = match fresh.remove(&pending.post_id) {
                Some(payload) => Ok(payload),
                None => {
                    debug!(
                        post_id = pending.post_id,
                        attempts = pending.attempts,
                        "retrying digest delivery"
                    );
                    self.store.payload_for_post(pending.post_id)
                }
            };
            let payload = match payload {
                Ok(payload) => payload,
                Err(e) => {
                    // Counts as an attempt so a corrupt standup stops being retried.
                    warn!(post_id = pending.post_id, "cannot rebuild digest: {e}");
                    report.failed += 1;
                    self.record(pending.post_id, Err(e.to_string()));
                    self.emit(DigestEvent::StandupFailed {
                        standup_id: pending.standup_id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let outcome = deliver(&payload).map_err(|e| e.to_string());
            let event = match &outcome {
                Ok(()) => {
                    report.delivered += 1;
                    DigestEvent::Delivered {
                        post_id: pending.post_id,
                    }
                }
                Err(message) => {
                    report.failed += 1;
                    DigestEvent::DeliveryFailed {
                        post_id: pending.post_id,
                        error: message.clone(),
                    }
                }
            };
            self.record(pending.post_id, outcome);
            self.emit(event);
        }

        if report != TickReport::default() {
            info!(
                sent = report.sent,
                delivered = report.delivered,
                failed = report.failed,
                "digest scheduler tick"
            );
        }
        Ok(report)
    }

    fn record(&self, post_id: PostId, outcome: std::result::Result<(), String>) {
        if let Err(e) = self
            .store
            .record_delivery(post_id, outcome, self.clock.now())
        {
            error!(post_id, "failed to record delivery outcome: {e}");
        }
    }

    fn emit(&self, event: DigestEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("digest event channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::StandupError;
    use crate::model::{ItemDraft, StandupDraft};
    use crate::timezone::{FixedClock, TimeZoneClock};
    use chrono::{NaiveDate, TimeDelta};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2001, 1, d).unwrap()
    }

    fn draft(title: &str, zone: &str) -> StandupDraft {
        StandupDraft {
            title: title.to_owned(),
            to_address: "team@example.com".to_owned(),
            time_zone_name: zone.to_owned(),
            start_time_string: "9:00am".to_owned(),
            ..StandupDraft::default()
        }
    }

    fn chicago_clock(d: u32, hour: u32) -> Arc<FixedClock> {
        let zone = TimeZoneClock::resolve("America/Chicago").unwrap();
        Arc::new(FixedClock::at_local(&zone, day(d), hour, 0).unwrap())
    }

    fn make_scheduler(
        clock: Arc<FixedClock>,
    ) -> (
        Arc<SqliteStandupStore>,
        DigestScheduler,
        mpsc::UnboundedReceiver<DigestEvent>,
    ) {
        let store = Arc::new(SqliteStandupStore::open_in_memory().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler =
            DigestScheduler::new(Arc::clone(&store), clock, SchedulerConfig::default())
                .with_events(tx);
        (store, scheduler, rx)
    }

    fn counting_delivery(count: Arc<AtomicUsize>, fail: Arc<AtomicBool>) -> DeliveryFn {
        Box::new(move |_payload| {
            count.fetch_add(1, Ordering::SeqCst);
            if fail.load(Ordering::SeqCst) {
                Err(StandupError::Delivery("smtp unavailable".to_owned()))
            } else {
                Ok(())
            }
        })
    }

    #[test]
    fn tick_sends_only_due_standups() {
        let clock = chicago_clock(1, 10);
        let (store, scheduler, mut rx) = make_scheduler(clock.clone());
        let chicago = store
            .create_standup(&draft("Chicago", "America/Chicago"))
            .unwrap();
        // 10:00 in Chicago is 08:00 in Los Angeles.
        store
            .create_standup(&draft("LA", "America/Los_Angeles"))
            .unwrap();
        store
            .create_item(&ItemDraft {
                standup_id: chicago.id,
                post_id: None,
                kind: "Help".to_owned(),
                title: "Printer".to_owned(),
                author: "Fred".to_owned(),
                date: day(1),
            })
            .unwrap();

        let report = scheduler.tick().unwrap();
        assert_eq!(report.sent, 1);

        match rx.try_recv().unwrap() {
            DigestEvent::Sent(payload) => {
                assert_eq!(payload.standup_id, chicago.id);
                assert_eq!(payload.item_count(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Same day again: nothing new.
        assert_eq!(scheduler.tick().unwrap().sent, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tick_before_start_sends_nothing() {
        let (store, scheduler, mut rx) = make_scheduler(chicago_clock(1, 8));
        store
            .create_standup(&draft("Chicago", "America/Chicago"))
            .unwrap();
        assert_eq!(scheduler.tick().unwrap(), TickReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn tick_delivers_sent_digest() {
        let clock = chicago_clock(1, 10);
        let (store, scheduler, mut rx) = make_scheduler(clock);
        let count = Arc::new(AtomicUsize::new(0));
        let scheduler =
            scheduler.with_delivery(counting_delivery(count.clone(), Arc::default()));
        store
            .create_standup(&draft("Chicago", "America/Chicago"))
            .unwrap();

        let report = scheduler.tick().unwrap();
        assert_eq!((report.sent, report.delivered, report.failed), (1, 1, 0));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.try_recv().unwrap(), DigestEvent::Sent(_)));
        assert!(matches!(
            rx.try_recv().unwrap(),
            DigestEvent::Delivered { .. }
        ));
        assert!(store.pending_deliveries(3).unwrap().is_empty());

        // Delivered posts are not redelivered.
        scheduler.tick().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_delivery_is_retried_until_limit() {
        let clock = chicago_clock(1, 10);
        let (store, scheduler, _rx) = make_scheduler(clock);
        let count = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicBool::new(true));
        let scheduler = scheduler.with_delivery(counting_delivery(count.clone(), fail.clone()));
        store
            .create_standup(&draft("Chicago", "America/Chicago"))
            .unwrap();

        let first = scheduler.tick().unwrap();
        assert_eq!((first.sent, first.failed), (1, 1));

        // Retries rebuild the payload; the digest is not sent twice.
        let second = scheduler.tick().unwrap();
        assert_eq!((second.sent, second.failed), (0, 1));
        let third = scheduler.tick().unwrap();
        assert_eq!(third.failed, 1);

        // Attempts exhausted at the default limit of 3.
        assert_eq!(scheduler.tick().unwrap(), TickReport::default());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_succeeds_after_transient_failure() {
        let clock = chicago_clock(1, 10);
        let (store, scheduler, mut rx) = make_scheduler(clock);
        let fail = Arc::new(AtomicBool::new(true));
        let scheduler =
            scheduler.with_delivery(counting_delivery(Arc::default(), fail.clone()));
        store
            .create_standup(&draft("Chicago", "America/Chicago"))
            .unwrap();

        scheduler.tick().unwrap();
        fail.store(false, Ordering::SeqCst);
        let report = scheduler.tick().unwrap();
        assert_eq!(report.delivered, 1);

        let events: Vec<DigestEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(matches!(events[1], DigestEvent::DeliveryFailed { .. }));
        assert!(matches!(events[2], DigestEvent::Delivered { .. }));
    }

    #[test]
    fn corrupt_standup_does_not_block_other_deliveries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standup.db");
        let store = Arc::new(SqliteStandupStore::open(&path).unwrap());
        let early = store
            .create_standup(&draft("Early", "America/Chicago"))
            .unwrap();
        let mut late_draft = draft("Late", "America/Chicago");
        late_draft.start_time_string = "11:00am".to_owned();
        let late = store.create_standup(&late_draft).unwrap();

        let clock = chicago_clock(1, 10);
        let early_id = early.id;
        let scheduler = DigestScheduler::new(
            Arc::clone(&store),
            clock.clone(),
            SchedulerConfig::default(),
        )
        .with_delivery(Box::new(move |payload| {
            if payload.standup_id == early_id {
                Err(StandupError::Delivery("mailbox full".to_owned()))
            } else {
                Ok(())
            }
        }));

        let first = scheduler.tick().unwrap();
        assert_eq!((first.sent, first.failed), (1, 1));

        rusqlite::Connection::open(&path)
            .unwrap()
            .execute(
                "UPDATE standups SET time_zone_name = 'Nowhere' WHERE id = ?1",
                rusqlite::params![early.id],
            )
            .unwrap();
        clock.advance(TimeDelta::hours(2));

        let second = scheduler.tick().unwrap();
        assert_eq!((second.sent, second.delivered, second.failed), (1, 1, 1));
        let pending = store.pending_deliveries(3).unwrap();
        assert!(pending.iter().all(|p| p.standup_id != late.id));

        // The corrupt post uses up its attempts and is then left alone.
        assert_eq!(scheduler.tick().unwrap().failed, 1);
        assert!(store.pending_deliveries(3).unwrap().is_empty());
        assert_eq!(scheduler.tick().unwrap(), TickReport::default());
    }

    #[test]
    fn next_day_sends_again() {
        let clock = chicago_clock(1, 10);
        let (store, scheduler, _rx) = make_scheduler(clock.clone());
        store
            .create_standup(&draft("Chicago", "America/Chicago"))
            .unwrap();

        assert_eq!(scheduler.tick().unwrap().sent, 1);
        clock.advance(TimeDelta::hours(12));
        assert_eq!(scheduler.tick().unwrap().sent, 0);
        clock.advance(TimeDelta::hours(12));
        assert_eq!(scheduler.tick().unwrap().sent, 1);
    }

    #[tokio::test]
    async fn run_starts_and_ticks() {
        let clock = chicago_clock(1, 10);
        let (store, scheduler, mut rx) = make_scheduler(clock);
        store
            .create_standup(&draft("Chicago", "America/Chicago"))
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = scheduler.run(cancel.clone());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert!(matches!(event.unwrap().unwrap(), DigestEvent::Sent(_)));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler stops on cancel")
            .unwrap();
    }
}
