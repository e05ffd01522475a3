//! A standup together with its items and posts.
//!
//! [`StandupAggregate`] is the read model every caller uses: the scheduler
//! asks [`StandupAggregate::is_due_now`] and
//! [`StandupAggregate::next_fire_time`], the listing and deck views render
//! [`StandupAggregate::pending_items_by_kind`], and the mailer receives a
//! [`DigestPayload`].

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::classify::{ItemsByKind, classify, group_by_kind};
use crate::error::Result;
use crate::model::{Item, Post, PostId, Standup, StandupId};
use crate::schedule::{self, StartTime};
use crate::timezone::{Clock, TimeZoneClock};

/// Standup plus its items and posts, with zone and start time resolved.
#[derive(Debug, Clone)]
pub struct StandupAggregate {
    standup: Standup,
    zone: TimeZoneClock,
    start: StartTime,
    items: Vec<Item>,
    posts: Vec<Post>,
}

impl StandupAggregate {
    /// Build the aggregate. `items` should be in creation order.
    ///
    /// # Errors
    ///
    /// Fails fast with [`crate::StandupError::InvalidTimeZone`] or
    /// [`crate::StandupError::MalformedTimeString`] when stored fields no
    /// longer parse.
    pub fn new(standup: Standup, items: Vec<Item>, posts: Vec<Post>) -> Result<Self> {
        let zone = standup.time_zone()?;
        let start = standup.start_time()?;
        Ok(Self {
            standup,
            zone,
            start,
            items,
            posts,
        })
    }

    /// The standup record.
    pub fn standup(&self) -> &Standup {
        &self.standup
    }

    /// Resolved zone.
    pub fn zone(&self) -> &TimeZoneClock {
        &self.zone
    }

    /// Parsed daily fire time.
    pub fn start_time(&self) -> StartTime {
        self.start
    }

    /// All items, pending or not.
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// All posts, sent or not.
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    /// Today's fire instant in the standup's zone.
    pub fn standup_time_today(&self, clock: &dyn Clock) -> DateTime<Tz> {
        schedule::standup_time_today(self.start, &self.zone, clock)
    }

    /// The instant the next digest should fire.
    pub fn next_fire_time(&self, clock: &dyn Clock) -> DateTime<Tz> {
        schedule::next_occurrence(self.start, &self.zone, clock)
    }

    /// Today's fire instant has passed.
    pub fn is_finished_today(&self, clock: &dyn Clock) -> bool {
        schedule::is_finished_today(self.start, &self.zone, clock)
    }

    /// A post was sent on today's zone-local date.
    pub fn sent_today(&self, clock: &dyn Clock) -> bool {
        self.last_sent_at().is_some_and(|sent| {
            sent.with_timezone(&self.zone.tz()).date_naive() == self.zone.today(clock)
        })
    }

    /// Today's fire instant has passed and today's digest has not gone out.
    pub fn is_due_now(&self, clock: &dyn Clock) -> bool {
        self.is_finished_today(clock) && !self.sent_today(clock)
    }

    /// Pending items grouped by kind.
    pub fn pending_items_by_kind(&self) -> ItemsByKind {
        classify(self.standup.id, &self.items)
    }

    /// Most recent `sent_at` among the posts; `None` if never sent.
    pub fn last_sent_at(&self) -> Option<DateTime<Utc>> {
        self.posts.iter().filter_map(|p| p.sent_at).max()
    }

    /// Items attached to `post_id`, grouped by kind.
    pub fn items_of_post(&self, post_id: PostId) -> ItemsByKind {
        group_by_kind(
            self.items
                .iter()
                .filter(|item| item.post_id == Some(post_id))
                .collect(),
        )
    }

    /// Digest of the currently pending items, as it would be sent today.
    pub fn preview(&self, clock: &dyn Clock) -> DigestPayload {
        DigestPayload::new(
            &self.standup,
            &self.zone,
            self.zone.today(clock),
            None,
            &self.pending_items_by_kind(),
        )
    }

    /// Digest of a stored post, e.g. to retry a failed delivery.
    pub fn payload_for_post(&self, post: &Post) -> DigestPayload {
        let date = post
            .sent_at
            .unwrap_or(post.created_at)
            .with_timezone(&self.zone.tz())
            .date_naive();
        DigestPayload::new(
            &self.standup,
            &self.zone,
            date,
            Some(post.id),
            &self.items_of_post(post.id),
        )
    }
}

/// Display fields of one item in a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestItem {
    /// Headline.
    pub title: String,
    /// Submitter.
    pub author: String,
    /// Date the item applies to.
    pub date: NaiveDate,
}

/// Items of one kind in a digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSection {
    /// Kind tag shared by every item in the section.
    pub kind: String,
    /// Items in date order.
    pub items: Vec<DigestItem>,
}

/// Everything the mailer needs to render and address one digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestPayload {
    /// Source standup.
    pub standup_id: StandupId,
    /// Post this digest was recorded as; `None` for previews.
    pub post_id: Option<PostId>,
    /// Recipient address.
    pub to_address: String,
    /// Subject prefix and title.
    pub subject: String,
    /// Standup title.
    pub title: String,
    /// Sign-off.
    pub closing_message: String,
    /// Canonical IANA zone of the standup.
    pub time_zone: String,
    /// Zone-local date the digest belongs to.
    pub date: NaiveDate,
    /// Deck images.
    pub image_urls: Vec<String>,
    /// Sections in [`ItemsByKind`] order.
    pub sections: Vec<DigestSection>,
}

impl DigestPayload {
    fn new(
        standup: &Standup,
        zone: &TimeZoneClock,
        date: NaiveDate,
        post_id: Option<PostId>,
        items: &ItemsByKind,
    ) -> Self {
        let sections = items
            .groups()
            .iter()
            .map(|group| DigestSection {
                kind: group.kind.clone(),
                items: group
                    .items
                    .iter()
                    .map(|item| DigestItem {
                        title: item.title.clone(),
                        author: item.author.clone(),
                        date: item.date,
                    })
                    .collect(),
            })
            .collect();

        Self {
            standup_id: standup.id,
            post_id,
            to_address: standup.to_address.clone(),
            subject: standup.subject_line(),
            title: standup.title.clone(),
            closing_message: standup.closing_message.clone(),
            time_zone: zone.identifier().to_owned(),
            date,
            image_urls: standup.image_urls.clone(),
            sections,
        }
    }

    /// Number of items across all sections.
    pub fn item_count(&self) -> usize {
        self.sections.iter().map(|s| s.items.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::StandupError;
    use crate::timezone::FixedClock;
    use chrono::{TimeDelta, TimeZone, Timelike};

    fn standup(zone: &str, start: &str) -> Standup {
        Standup {
            id: 1,
            title: "Chicago Standup".to_owned(),
            to_address: "chi@example.com".to_owned(),
            subject_prefix: "[Standup][CHI]".to_owned(),
            closing_message: "Have a great day".to_owned(),
            time_zone_name: zone.to_owned(),
            start_time_string: start.to_owned(),
            image_urls: vec!["https://example.com/cat.gif".to_owned()],
            image_days: vec!["Mon".to_owned()],
        }
    }

    fn item(id: i64, kind: &str, date: NaiveDate, post_id: Option<PostId>) -> Item {
        Item {
            id,
            standup_id: 1,
            post_id,
            kind: kind.to_owned(),
            title: format!("item {id}"),
            author: "Wilma".to_owned(),
            date,
        }
    }

    fn post(id: PostId, sent_at: Option<DateTime<Utc>>) -> Post {
        Post {
            id,
            standup_id: 1,
            title: format!("post {id}"),
            sent_at,
            created_at: Utc.with_ymd_and_hms(2000, 12, 1, 0, 0, 0).unwrap(),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2001, 1, d).unwrap()
    }

    fn chicago_aggregate(posts: Vec<Post>) -> StandupAggregate {
        StandupAggregate::new(standup("America/Chicago", "9:00am"), Vec::new(), posts).unwrap()
    }

    #[test]
    fn before_start_is_not_due_and_fires_today() {
        let agg = chicago_aggregate(Vec::new());
        let clock = FixedClock::at_local(agg.zone(), day(1), 8, 0).unwrap();

        assert!(!agg.is_due_now(&clock));
        let next = agg.next_fire_time(&clock);
        assert_eq!(next.date_naive(), day(1));
        assert_eq!((next.hour(), next.minute()), (9, 0));
    }

    #[test]
    fn after_start_is_due_and_fires_tomorrow() {
        let agg = chicago_aggregate(Vec::new());
        let clock = FixedClock::at_local(agg.zone(), day(1), 10, 0).unwrap();

        assert!(agg.is_due_now(&clock));
        let next = agg.next_fire_time(&clock);
        assert_eq!(next.date_naive(), day(2));
        assert_eq!((next.hour(), next.minute()), (9, 0));
    }

    #[test]
    fn sent_today_suppresses_due() {
        let zone = TimeZoneClock::resolve("America/Chicago").unwrap();
        let sent = FixedClock::at_local(&zone, day(1), 9, 1).unwrap().now();
        let agg = chicago_aggregate(vec![post(1, Some(sent))]);

        let clock = FixedClock::at_local(&zone, day(1), 10, 0).unwrap();
        assert!(agg.sent_today(&clock));
        assert!(!agg.is_due_now(&clock));

        // Next day the same post no longer counts.
        clock.advance(TimeDelta::days(1));
        assert!(agg.is_due_now(&clock));
    }

    #[test]
    fn last_sent_at_is_latest_non_null() {
        assert_eq!(chicago_aggregate(Vec::new()).last_sent_at(), None);
        assert_eq!(
            chicago_aggregate(vec![post(1, None)]).last_sent_at(),
            None
        );

        let older = Utc.with_ymd_and_hms(2001, 1, 1, 15, 0, 0).unwrap();
        let newer = Utc.with_ymd_and_hms(2001, 1, 2, 15, 0, 0).unwrap();
        let agg = chicago_aggregate(vec![post(1, Some(newer)), post(2, None), post(3, Some(older))]);
        assert_eq!(agg.last_sent_at(), Some(newer));
    }

    #[test]
    fn corrupt_stored_fields_fail_fast() {
        let err = StandupAggregate::new(standup("Atlantis/Capital", "9:00am"), vec![], vec![])
            .unwrap_err();
        assert!(matches!(err, StandupError::InvalidTimeZone(_)));

        let err = StandupAggregate::new(standup("America/Chicago", "teatime"), vec![], vec![])
            .unwrap_err();
        assert!(matches!(err, StandupError::MalformedTimeString(_)));
    }

    #[test]
    fn pending_items_exclude_posted() {
        let items = vec![
            item(1, "Help", day(3), None),
            item(2, "Help", day(1), Some(9)),
            item(3, "Event", day(2), None),
        ];
        let agg = StandupAggregate::new(standup("UTC", "9:00am"), items, vec![]).unwrap();
        let pending = agg.pending_items_by_kind();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.kinds().collect::<Vec<_>>(), vec!["Event", "Help"]);

        let posted = agg.items_of_post(9);
        assert_eq!(posted.len(), 1);
        assert_eq!(posted.get("Help").unwrap()[0].id, 2);
    }

    #[test]
    fn preview_payload_carries_display_fields() {
        let items = vec![item(1, "New face", day(2), None), item(2, "Help", day(1), None)];
        let agg = StandupAggregate::new(standup("Central Time (US & Canada)", "9:00am"), items, vec![])
            .unwrap();
        let clock = FixedClock::at_local(agg.zone(), day(2), 10, 0).unwrap();

        let payload = agg.preview(&clock);
        assert_eq!(payload.subject, "[Standup][CHI] Chicago Standup");
        assert_eq!(payload.to_address, "chi@example.com");
        assert_eq!(payload.time_zone, "America/Chicago");
        assert_eq!(payload.date, day(2));
        assert_eq!(payload.post_id, None);
        assert_eq!(payload.item_count(), 2);
        assert_eq!(payload.sections[0].kind, "Help");
        assert_eq!(payload.sections[1].kind, "New face");
    }

    #[test]
    fn post_payload_uses_sent_date_in_zone() {
        // 2001-01-03 02:00 UTC is Jan 2 in Chicago.
        let sent = Utc.with_ymd_and_hms(2001, 1, 3, 2, 0, 0).unwrap();
        let items = vec![item(1, "Help", day(1), Some(4))];
        let agg = StandupAggregate::new(
            standup("America/Chicago", "9:00am"),
            items,
            vec![post(4, Some(sent))],
        )
        .unwrap();

        let payload = agg.payload_for_post(&agg.posts()[0]);
        assert_eq!(payload.date, day(2));
        assert_eq!(payload.post_id, Some(4));
        assert_eq!(payload.item_count(), 1);
    }
}
