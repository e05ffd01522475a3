//! Standup, Item and Post records plus draft validation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DefaultsConfig;
use crate::error::{Result, ValidationErrors};
use crate::schedule::StartTime;
use crate::timezone::{Clock, TimeZoneClock};

/// Row id of a standup.
pub type StandupId = i64;
/// Row id of an item.
pub type ItemId = i64;
/// Row id of a post.
pub type PostId = i64;

/// Editable fields of a standup. Validated before every write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StandupDraft {
    /// Display title; also the subject line body.
    pub title: String,
    /// Recipient address for the digest email.
    pub to_address: String,
    /// Prepended to the title to form the subject line.
    pub subject_prefix: String,
    /// Sign-off appended to the digest.
    pub closing_message: String,
    /// IANA identifier or friendly zone name.
    pub time_zone_name: String,
    /// Daily fire time, e.g. `9:00am`.
    pub start_time_string: String,
    /// Images shown in the presentation deck, in order.
    pub image_urls: Vec<String>,
    /// Weekday selectors for the image rotation.
    pub image_days: Vec<String>,
}

impl StandupDraft {
    /// Blank draft prefilled with the configured zone and start time.
    pub fn with_defaults(defaults: &DefaultsConfig) -> Self {
        Self {
            time_zone_name: defaults.time_zone_name.clone(),
            start_time_string: defaults.start_time.clone(),
            ..Self::default()
        }
    }

    /// Check every field and report all failures together.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StandupError::Validation`] listing each bad field.
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::default();
        if self.title.trim().is_empty() {
            errors.add("title", "can't be blank");
        }
        if self.to_address.trim().is_empty() {
            errors.add("to_address", "can't be blank");
        }
        if StartTime::parse(&self.start_time_string).is_err() {
            errors.add("start_time_string", "should be in the format: 9:00am");
        }
        if TimeZoneClock::resolve(&self.time_zone_name).is_err() {
            errors.add("time_zone_name", "is not a recognised time zone");
        }
        errors.into_result()
    }
}

/// A persisted standup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Standup {
    /// Row id.
    pub id: StandupId,
    /// Display title.
    pub title: String,
    /// Recipient address.
    pub to_address: String,
    /// Subject prefix.
    pub subject_prefix: String,
    /// Closing message.
    pub closing_message: String,
    /// Zone name as entered.
    pub time_zone_name: String,
    /// Daily fire time as entered.
    pub start_time_string: String,
    /// Deck images.
    pub image_urls: Vec<String>,
    /// Image weekday selectors.
    pub image_days: Vec<String>,
}

impl Standup {
    /// Resolve the stored zone name.
    ///
    /// # Errors
    ///
    /// [`crate::StandupError::InvalidTimeZone`] if the stored name no longer resolves.
    pub fn time_zone(&self) -> Result<TimeZoneClock> {
        TimeZoneClock::resolve(&self.time_zone_name)
    }

    /// Canonical IANA identifier of the stored zone.
    pub fn time_zone_name_iana(&self) -> Result<&'static str> {
        Ok(self.time_zone()?.identifier())
    }

    /// Parse the stored start time.
    ///
    /// # Errors
    ///
    /// [`crate::StandupError::MalformedTimeString`] if the stored string is corrupt.
    pub fn start_time(&self) -> Result<StartTime> {
        StartTime::parse(&self.start_time_string)
    }

    /// Today's date in the standup's zone.
    pub fn date_today(&self, clock: &dyn Clock) -> Result<NaiveDate> {
        Ok(self.time_zone()?.today(clock))
    }

    /// Tomorrow's date in the standup's zone.
    pub fn date_tomorrow(&self, clock: &dyn Clock) -> Result<NaiveDate> {
        Ok(self.time_zone()?.tomorrow(clock))
    }

    /// Email subject: prefix and title separated by one space.
    pub fn subject_line(&self) -> String {
        let prefix = self.subject_prefix.trim();
        if prefix.is_empty() {
            self.title.clone()
        } else {
            format!("{prefix} {}", self.title)
        }
    }

    /// The editable fields, e.g. to prefill an edit form.
    pub fn to_draft(&self) -> StandupDraft {
        StandupDraft {
            title: self.title.clone(),
            to_address: self.to_address.clone(),
            subject_prefix: self.subject_prefix.clone(),
            closing_message: self.closing_message.clone(),
            time_zone_name: self.time_zone_name.clone(),
            start_time_string: self.start_time_string.clone(),
            image_urls: self.image_urls.clone(),
            image_days: self.image_days.clone(),
        }
    }
}

/// Editable fields of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDraft {
    /// Owning standup.
    pub standup_id: StandupId,
    /// Attach directly to this post instead of leaving the item pending.
    pub post_id: Option<PostId>,
    /// Free-form kind tag (`Help`, `New face`, `Event`, ...).
    pub kind: String,
    /// Headline.
    pub title: String,
    /// Submitter.
    pub author: String,
    /// Calendar date, zone-naive.
    pub date: NaiveDate,
}

impl ItemDraft {
    /// New pending item dated today in the standup's zone.
    pub fn for_standup(
        standup: &Standup,
        kind: impl Into<String>,
        author: impl Into<String>,
        clock: &dyn Clock,
    ) -> Result<Self> {
        Ok(Self {
            standup_id: standup.id,
            post_id: None,
            kind: kind.into(),
            title: String::new(),
            author: author.into(),
            date: standup.date_today(clock)?,
        })
    }

    /// Set the title.
    #[must_use]
    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Check kind and title.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StandupError::Validation`] listing each bad field.
    pub fn validate(&self) -> Result<()> {
        let mut errors = ValidationErrors::default();
        if self.kind.trim().is_empty() {
            errors.add("kind", "can't be blank");
        }
        if self.title.trim().is_empty() {
            errors.add("title", "can't be blank");
        }
        errors.into_result()
    }
}

/// Partial update of an item; `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemChanges {
    /// New kind tag.
    pub kind: Option<String>,
    /// New headline.
    pub title: Option<String>,
    /// New submitter.
    pub author: Option<String>,
    /// New item date.
    pub date: Option<NaiveDate>,
}

/// A submitted item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Row id; increases with creation order.
    pub id: ItemId,
    /// Owning standup.
    pub standup_id: StandupId,
    /// Post that consumed this item, if any.
    pub post_id: Option<PostId>,
    /// Kind tag.
    pub kind: String,
    /// Headline.
    pub title: String,
    /// Submitter.
    pub author: String,
    /// Calendar date.
    pub date: NaiveDate,
}

impl Item {
    /// Not yet consumed by any post.
    pub fn is_pending(&self) -> bool {
        self.post_id.is_none()
    }

    /// Apply `changes` and return the would-be draft for validation.
    pub(crate) fn with_changes(&self, changes: &ItemChanges) -> ItemDraft {
        ItemDraft {
            standup_id: self.standup_id,
            post_id: self.post_id,
            kind: changes.kind.clone().unwrap_or_else(|| self.kind.clone()),
            title: changes.title.clone().unwrap_or_else(|| self.title.clone()),
            author: changes.author.clone().unwrap_or_else(|| self.author.clone()),
            date: changes.date.unwrap_or(self.date),
        }
    }
}

/// One digest instance; `sent_at` is set once delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    /// Row id.
    pub id: PostId,
    /// Owning standup.
    pub standup_id: StandupId,
    /// Display title, e.g. `2001-01-01: NYC Standup`.
    pub title: String,
    /// When the digest went out.
    pub sent_at: Option<DateTime<Utc>>,
    /// When the post was created.
    pub created_at: DateTime<Utc>,
}

impl Post {
    /// Title for a digest composed on `date`.
    pub fn title_for(standup: &Standup, date: NaiveDate) -> String {
        format!("{}: {}", date.format("%Y-%m-%d"), standup.title)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::StandupError;
    use crate::timezone::FixedClock;
    use chrono::TimeZone;

    fn valid_draft() -> StandupDraft {
        StandupDraft {
            title: "NYC Standup".to_owned(),
            to_address: "team@example.com".to_owned(),
            subject_prefix: "[Standup][NY]".to_owned(),
            time_zone_name: "Eastern Time (US & Canada)".to_owned(),
            start_time_string: "9:06am".to_owned(),
            ..StandupDraft::default()
        }
    }

    fn standup() -> Standup {
        let d = valid_draft();
        Standup {
            id: 1,
            title: d.title,
            to_address: d.to_address,
            subject_prefix: d.subject_prefix,
            closing_message: d.closing_message,
            time_zone_name: d.time_zone_name,
            start_time_string: d.start_time_string,
            image_urls: d.image_urls,
            image_days: d.image_days,
        }
    }

    #[test]
    fn valid_draft_passes() {
        assert!(valid_draft().validate().is_ok());
    }

    #[test]
    fn validation_collects_every_bad_field() {
        let draft = StandupDraft {
            title: "  ".to_owned(),
            start_time_string: "nine".to_owned(),
            time_zone_name: "Nowhere/Special".to_owned(),
            ..StandupDraft::default()
        };
        let Err(StandupError::Validation(errors)) = draft.validate() else {
            panic!("expected validation failure");
        };
        assert!(errors.has("title"));
        assert!(errors.has("to_address"));
        assert!(errors.has("start_time_string"));
        assert!(errors.has("time_zone_name"));
        assert_eq!(errors.errors().len(), 4);
    }

    #[test]
    fn defaults_prefill_zone_and_start() {
        let draft = StandupDraft::with_defaults(&DefaultsConfig::default());
        assert_eq!(draft.time_zone_name, "UTC");
        assert_eq!(draft.start_time_string, "9:00am");
        assert!(draft.title.is_empty());
    }

    #[test]
    fn subject_line_joins_prefix_and_title() {
        let mut s = standup();
        assert_eq!(s.subject_line(), "[Standup][NY] NYC Standup");
        s.subject_prefix = String::new();
        assert_eq!(s.subject_line(), "NYC Standup");
    }

    #[test]
    fn iana_name_from_friendly_name() {
        assert_eq!(standup().time_zone_name_iana().unwrap(), "America/New_York");
    }

    #[test]
    fn new_item_is_dated_in_standup_zone() {
        // 2001-01-02 01:00 UTC is still Jan 1 in New York.
        let clock = FixedClock::new(chrono::Utc.with_ymd_and_hms(2001, 1, 2, 1, 0, 0).unwrap());
        let draft = ItemDraft::for_standup(&standup(), "Help", "Barney Rubble", &clock).unwrap();
        assert_eq!(draft.date, NaiveDate::from_ymd_opt(2001, 1, 1).unwrap());
        assert_eq!(draft.author, "Barney Rubble");
        assert!(draft.post_id.is_none());
    }

    #[test]
    fn item_requires_kind_and_title() {
        let clock = FixedClock::new(chrono::Utc::now());
        let draft = ItemDraft::for_standup(&standup(), "Garbage", "", &clock).unwrap();
        let Err(StandupError::Validation(errors)) = draft.validate() else {
            panic!("expected validation failure");
        };
        assert!(errors.has("title"));
        assert!(!errors.has("kind"));
        assert!(draft.titled("Ok").validate().is_ok());
    }

    #[test]
    fn item_changes_keep_unset_fields() {
        let item = Item {
            id: 3,
            standup_id: 1,
            post_id: None,
            kind: "Help".to_owned(),
            title: "Old".to_owned(),
            author: "Fred".to_owned(),
            date: NaiveDate::from_ymd_opt(2001, 1, 1).unwrap(),
        };
        let draft = item.with_changes(&ItemChanges {
            title: Some("New Title".to_owned()),
            ..ItemChanges::default()
        });
        assert_eq!(draft.title, "New Title");
        assert_eq!(draft.kind, "Help");
        assert_eq!(draft.author, "Fred");
    }
}
