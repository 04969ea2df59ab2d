//! Routing-group assignment carried by a credential.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Status value for an enabled credential or group entry
pub const STATUS_ENABLED: i32 = 1;

/// Status value written when a group entry is switched off
pub const STATUS_DISABLED: i32 = 3;

/// Separator used by the legacy flat representation of several groups
pub const LEGACY_DELIMITER: char = ',';

/// Persisted multi-group descriptor, stored as a JSON blob next to the
/// flat `group` column and mirrored into the credential cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupInfo {
    pub is_multi_group: bool,
    pub multi_group_size: usize,
    pub multi_group_list: Vec<String>,
    /// Index -> status; an absent index is enabled
    pub multi_group_status_list: BTreeMap<usize, i32>,
    pub current_group_index: usize,
}

/// Ordered groups with per-entry availability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiGroup {
    groups: Vec<String>,
    statuses: BTreeMap<usize, i32>,
    current_index: usize,
}

impl MultiGroup {
    fn new(groups: Vec<String>) -> Self {
        Self {
            groups,
            statuses: BTreeMap::new(),
            current_index: 0,
        }
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn is_enabled(&self, index: usize) -> bool {
        self.statuses
            .get(&index)
            .map_or(true, |status| *status == STATUS_ENABLED)
    }

    /// First enabled entry in priority order, or the first entry when every
    /// entry is disabled
    pub fn resolve(&self) -> &str {
        self.groups
            .iter()
            .enumerate()
            .find(|(index, _)| self.is_enabled(*index))
            .or_else(|| self.groups.first().map(|group| (0, group)))
            .map_or("", |(_, group)| group.as_str())
    }
}

/// How a credential maps onto routing groups
///
/// `Flat` is the single-column form; an empty name means "system default".
/// A flat name may still hold a legacy comma-joined list until it is
/// migrated with [`GroupAssignment::migrate_legacy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAssignment {
    Flat(String),
    Multi(MultiGroup),
}

impl Default for GroupAssignment {
    fn default() -> Self {
        Self::Flat(String::new())
    }
}

impl GroupAssignment {
    pub fn flat(group: impl Into<String>) -> Self {
        Self::Flat(group.into())
    }

    /// Multi-group form for two or more entries, flat otherwise
    pub fn from_groups(groups: Vec<String>) -> Self {
        if groups.len() >= 2 {
            Self::Multi(MultiGroup::new(groups))
        } else {
            Self::Flat(groups.into_iter().next().unwrap_or_default())
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Self::Multi(_))
    }

    /// Value of the flat `group` column; the first entry in multi-group form
    pub fn flat_group(&self) -> &str {
        match self {
            Self::Flat(group) => group,
            Self::Multi(multi) => multi.groups.first().map_or("", String::as_str),
        }
    }

    pub fn resolve(&self) -> &str {
        match self {
            Self::Flat(group) => group,
            Self::Multi(multi) => multi.resolve(),
        }
    }

    /// Every group in priority order
    pub fn all_groups(&self) -> Vec<String> {
        match self {
            Self::Flat(group) if group.is_empty() => Vec::new(),
            Self::Flat(group) => vec![group.clone()],
            Self::Multi(multi) => multi.groups.clone(),
        }
    }

    /// Replace the group list
    ///
    /// An empty list keeps the current flat name and drops multi-group state.
    pub fn set_groups(&mut self, groups: Vec<String>) {
        *self = match groups.len() {
            0 => Self::Flat(self.flat_group().to_string()),
            _ => Self::from_groups(groups),
        };
    }

    /// Returns whether an entry changed; flat form and out-of-range indices
    /// are no-ops
    pub fn disable_at(&mut self, index: usize) -> bool {
        match self {
            Self::Multi(multi) if index < multi.groups.len() => {
                multi.statuses.insert(index, STATUS_DISABLED) != Some(STATUS_DISABLED)
            }
            _ => false,
        }
    }

    pub fn enable_at(&mut self, index: usize) -> bool {
        match self {
            Self::Multi(multi) if index < multi.groups.len() => {
                multi.statuses.remove(&index).is_some()
            }
            _ => false,
        }
    }

    /// Names held in a legacy comma-joined flat field, when there are at
    /// least two after trimming
    pub fn legacy_groups(&self) -> Option<Vec<String>> {
        let Self::Flat(group) = self else {
            return None;
        };
        if !group.contains(LEGACY_DELIMITER) {
            return None;
        }
        let cleaned: Vec<String> = group
            .split(LEGACY_DELIMITER)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        (cleaned.len() >= 2).then_some(cleaned)
    }

    /// Upgrade a legacy comma-joined flat field in place
    pub fn migrate_legacy(&mut self) -> bool {
        match self.legacy_groups() {
            Some(groups) => {
                *self = Self::Multi(MultiGroup::new(groups));
                true
            }
            None => false,
        }
    }

    /// Split into the flat column and the optional descriptor blob
    pub fn to_persisted(&self) -> (String, Option<GroupInfo>) {
        let info = match self {
            Self::Flat(_) => None,
            Self::Multi(multi) => Some(GroupInfo {
                is_multi_group: true,
                multi_group_size: multi.groups.len(),
                multi_group_list: multi.groups.clone(),
                multi_group_status_list: multi.statuses.clone(),
                current_group_index: multi.current_index,
            }),
        };
        (self.flat_group().to_string(), info)
    }

    /// Rebuild from the persisted columns
    pub fn from_persisted(group: &str, info: Option<GroupInfo>) -> Self {
        match info {
            Some(info) if info.is_multi_group && !info.multi_group_list.is_empty() => {
                Self::Multi(MultiGroup {
                    groups: info.multi_group_list,
                    statuses: info.multi_group_status_list,
                    current_index: info.current_group_index,
                })
            }
            _ => Self::Flat(group.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_resolution_skips_disabled_entries() {
        let mut groups = GroupAssignment::from_groups(names(&["A", "B", "C"]));
        assert_eq!(groups.resolve(), "A");

        groups.disable_at(1);
        assert_eq!(groups.resolve(), "A");

        groups.disable_at(0);
        assert_eq!(groups.resolve(), "C");

        groups.disable_at(2);
        assert_eq!(groups.resolve(), "A");

        groups.enable_at(1);
        assert_eq!(groups.resolve(), "B");
    }

    #[test]
    fn test_flat_resolution_is_unchanged() {
        assert_eq!(GroupAssignment::flat("").resolve(), "");
        assert_eq!(GroupAssignment::flat("vip").resolve(), "vip");
        assert!(GroupAssignment::flat("").all_groups().is_empty());
    }

    #[test]
    fn test_set_groups_collapses_short_lists() {
        let mut groups = GroupAssignment::from_groups(names(&["A", "B"]));
        groups.disable_at(0);

        groups.set_groups(names(&["solo"]));
        assert_eq!(groups, GroupAssignment::flat("solo"));

        groups.set_groups(Vec::new());
        assert_eq!(groups, GroupAssignment::flat("solo"));

        groups.set_groups(names(&["x", "y"]));
        assert!(groups.is_multi());
        assert_eq!(groups.flat_group(), "x");
    }

    #[test]
    fn test_set_groups_resets_statuses() {
        let mut groups = GroupAssignment::from_groups(names(&["A", "B"]));
        groups.disable_at(0);
        groups.set_groups(names(&["A", "B"]));
        assert_eq!(groups.resolve(), "A");
    }

    #[test]
    fn test_out_of_range_toggles_are_noops() {
        let mut groups = GroupAssignment::from_groups(names(&["A", "B"]));
        let before = groups.clone();
        assert!(!groups.disable_at(2));
        assert!(!groups.enable_at(9));
        assert_eq!(groups, before);

        let mut flat = GroupAssignment::flat("A");
        assert!(!flat.disable_at(0));
    }

    #[test]
    fn test_legacy_migration() {
        let mut groups = GroupAssignment::flat("a, b , c");
        assert!(groups.migrate_legacy());
        assert_eq!(groups.all_groups(), names(&["a", "b", "c"]));
        assert_eq!(groups.resolve(), "a");
        assert!(!groups.migrate_legacy());
    }

    #[test]
    fn test_legacy_migration_needs_two_names() {
        let mut groups = GroupAssignment::flat(" a , , ");
        assert!(!groups.migrate_legacy());
        assert_eq!(groups, GroupAssignment::flat(" a , , "));
    }

    #[test]
    fn test_persisted_form_mirrors_first_entry() {
        let mut groups = GroupAssignment::from_groups(names(&["A", "B"]));
        groups.disable_at(1);

        let (flat, info) = groups.to_persisted();
        assert_eq!(flat, "A");
        let info = info.unwrap();
        assert_eq!(info.multi_group_size, 2);
        assert_eq!(info.multi_group_status_list.get(&1), Some(&STATUS_DISABLED));

        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains("\"multi_group_status_list\":{\"1\":3}"));
        let decoded: GroupInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(GroupAssignment::from_persisted(&flat, Some(decoded)), groups);
    }

    #[test]
    fn test_unknown_status_values_count_as_disabled() {
        let info: GroupInfo = serde_json::from_str(
            r#"{"is_multi_group":true,"multi_group_list":["A","B"],"multi_group_status_list":{"0":2}}"#,
        )
        .unwrap();
        let groups = GroupAssignment::from_persisted("A", Some(info));
        assert_eq!(groups.resolve(), "B");
    }
}
