//! Persistent storage for standups, items and posts.

pub(crate) mod schema;
pub mod sqlite;

pub use sqlite::{PendingDelivery, SqliteStandupStore};
