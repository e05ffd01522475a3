//! Grouping of pending items by kind.
//!
//! The management listing and the presentation deck both render the same
//! [`ItemsByKind`], built by the one filter and ordering in [`classify`].

use serde::{Serialize, Serializer};
use serde::ser::SerializeMap;

use crate::model::{Item, StandupId};

/// Items of one kind, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindGroup {
    /// Kind tag shared by every item in the group.
    pub kind: String,
    /// Items ordered by date, then creation order.
    pub items: Vec<Item>,
}

/// Ordered mapping from kind to items.
///
/// Groups appear in order of their oldest item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemsByKind {
    groups: Vec<KindGroup>,
}

impl ItemsByKind {
    /// Items of `kind`, or `None` when no pending item has that kind.
    pub fn get(&self, kind: &str) -> Option<&[Item]> {
        self.groups
            .iter()
            .find(|g| g.kind == kind)
            .map(|g| g.items.as_slice())
    }

    /// Kinds present, in group order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|g| g.kind.as_str())
    }

    /// Groups in order.
    pub fn groups(&self) -> &[KindGroup] {
        &self.groups
    }

    /// Total items across all groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.items.len()).sum()
    }

    /// `true` when there are no pending items.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

impl Serialize for ItemsByKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.groups.len()))?;
        for group in &self.groups {
            map.serialize_entry(&group.kind, &group.items)?;
        }
        map.end()
    }
}

/// Group the pending items of `standup_id` by kind.
///
/// Items already attached to a post and items of other standups are
/// dropped. `items` is expected in creation order; equal dates keep it.
pub fn classify<'a, I>(standup_id: StandupId, items: I) -> ItemsByKind
where
    I: IntoIterator<Item = &'a Item>,
{
    let eligible: Vec<&Item> = items
        .into_iter()
        .filter(|item| item.standup_id == standup_id && item.is_pending())
        .collect();
    group_by_kind(eligible)
}

/// Order `items` by date and group them by kind, without filtering.
pub(crate) fn group_by_kind(mut items: Vec<&Item>) -> ItemsByKind {
    // Stable: ties stay in input order.
    items.sort_by_key(|item| item.date);

    let mut groups: Vec<KindGroup> = Vec::new();
    for item in items {
        match groups.iter_mut().find(|g| g.kind == item.kind) {
            Some(group) => group.items.push(item.clone()),
            None => groups.push(KindGroup {
                kind: item.kind.clone(),
                items: vec![item.clone()],
            }),
        }
    }

    ItemsByKind { groups }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::NaiveDate;

    const STANDUP: StandupId = 1;

    fn item(id: i64, standup_id: StandupId, kind: &str, day: u32) -> Item {
        Item {
            id,
            standup_id,
            post_id: None,
            kind: kind.to_owned(),
            title: format!("item {id}"),
            author: "Fred".to_owned(),
            date: NaiveDate::from_ymd_opt(2001, 1, day).unwrap(),
        }
    }

    fn ids(items: &[Item]) -> Vec<i64> {
        items.iter().map(|i| i.id).collect()
    }

    #[test]
    fn groups_by_kind() {
        let items = vec![
            item(1, STANDUP, "Help", 5),
            item(2, STANDUP, "New face", 5),
            item(3, STANDUP, "Interesting", 5),
        ];
        let grouped = classify(STANDUP, &items);
        assert_eq!(ids(grouped.get("Help").unwrap()), vec![1]);
        assert_eq!(ids(grouped.get("New face").unwrap()), vec![2]);
        assert_eq!(ids(grouped.get("Interesting").unwrap()), vec![3]);
        assert_eq!(grouped.len(), 3);
    }

    #[test]
    fn sorts_each_group_by_date_ascending() {
        let items = vec![item(1, STANDUP, "Help", 9), item(2, STANDUP, "Help", 6)];
        let grouped = classify(STANDUP, &items);
        assert_eq!(ids(grouped.get("Help").unwrap()), vec![2, 1]);
    }

    #[test]
    fn equal_dates_keep_creation_order() {
        let items = vec![
            item(1, STANDUP, "Event", 3),
            item(2, STANDUP, "Event", 3),
            item(3, STANDUP, "Event", 2),
            item(4, STANDUP, "Event", 3),
        ];
        let grouped = classify(STANDUP, &items);
        assert_eq!(ids(grouped.get("Event").unwrap()), vec![3, 1, 2, 4]);
    }

    #[test]
    fn excludes_items_attached_to_a_post() {
        let mut sent = item(4, STANDUP, "Help", 1);
        sent.post_id = Some(10);
        let items = vec![item(1, STANDUP, "Help", 2), sent];
        let grouped = classify(STANDUP, &items);
        assert_eq!(ids(grouped.get("Help").unwrap()), vec![1]);
    }

    #[test]
    fn excludes_items_of_other_standups() {
        let items = vec![item(1, STANDUP, "Event", 2), item(2, 2, "Event", 2)];
        let grouped = classify(STANDUP, &items);
        assert_eq!(ids(grouped.get("Event").unwrap()), vec![1]);
    }

    #[test]
    fn kinds_are_case_sensitive_and_data_driven() {
        let items = vec![
            item(1, STANDUP, "help", 1),
            item(2, STANDUP, "Help", 2),
            item(3, STANDUP, "Lunch & Learn", 3),
        ];
        let grouped = classify(STANDUP, &items);
        let kinds: Vec<&str> = grouped.kinds().collect();
        assert_eq!(kinds, vec!["help", "Help", "Lunch & Learn"]);
        assert!(grouped.get("HELP").is_none());
    }

    #[test]
    fn empty_input_has_no_groups() {
        let grouped = classify(STANDUP, &Vec::<Item>::new());
        assert!(grouped.is_empty());
        assert_eq!(grouped.kinds().count(), 0);
    }

    #[test]
    fn serializes_as_ordered_map() {
        let items = vec![item(1, STANDUP, "New face", 2), item(2, STANDUP, "Help", 1)];
        let json = serde_json::to_string(&classify(STANDUP, &items)).unwrap();
        let help = json.find("\"Help\"").unwrap();
        let new_face = json.find("\"New face\"").unwrap();
        assert!(help < new_face);
    }
}
