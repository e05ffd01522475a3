//! Standup digest: timezone-aware scheduling for recurring standup emails.
//!
//! Each standup fires once a day at a wall-clock time in its own zone and
//! sends a digest of the items collected since the last one.
//!
//! # Architecture
//!
//! - **Time**: [`TimeZoneClock`] resolves zone names and answers "today"
//!   against an injected [`Clock`]
//! - **Schedule**: [`StartTime`] parses `9:00am` strings; the [`schedule`]
//!   functions compute today's fire instant and the next one
//! - **Classification**: [`classify`] groups pending items by kind, oldest first
//! - **Aggregate**: [`StandupAggregate`] combines a standup with its items and
//!   posts and builds [`DigestPayload`]s
//! - **Store**: [`SqliteStandupStore`] persists records and sends digests
//!   atomically
//! - **Scheduler**: [`DigestScheduler`] ticks in the background and hands
//!   digests to a delivery callback

#![warn(missing_docs)]

pub mod classify;
pub mod config;
pub mod error;
pub mod model;
pub mod schedule;
pub mod scheduler;
pub mod standup;
pub mod store;
pub mod timezone;

pub use classify::{ItemsByKind, KindGroup, classify};
pub use config::DigestConfig;
pub use error::{FieldError, Result, StandupError, ValidationErrors};
pub use model::{
    Item, ItemChanges, ItemDraft, ItemId, Post, PostId, Standup, StandupDraft, StandupId,
};
pub use schedule::StartTime;
pub use scheduler::{DeliveryFn, DigestEvent, DigestScheduler, TickReport};
pub use standup::{DigestItem, DigestPayload, DigestSection, StandupAggregate};
pub use store::{PendingDelivery, SqliteStandupStore};
pub use timezone::{Clock, FixedClock, SystemClock, TimeZoneClock};
