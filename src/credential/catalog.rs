//! Catalog of groups a caller may pick from.
//!
//! The catalog is a hot-updatable JSON document mapping group name to a
//! description and a priority (smaller sorts first):
//!
//! ```json
//! { "default": { "description": "Default group", "priority": 10 },
//!   "vip":     { "description": "VIP group",     "priority": 5 } }
//! ```
//!
//! The older description-only form `{"default": "Default group"}` is still
//! accepted; its entries receive priorities 10, 20, 30, ... in name order.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::core::error::{GatewayError, GatewayResult};

/// Group every caller can always fall back to
pub const DEFAULT_GROUP: &str = "default";

/// Priority of the default group when the catalog does not list it
pub const DEFAULT_GROUP_PRIORITY: i32 = 10;

/// Priority given to groups the catalog does not know about
pub const UNLISTED_GROUP_PRIORITY: i32 = 999;

const LEGACY_PRIORITY_STEP: i32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: i32,
}

/// One row of a caller's sorted group listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsableGroup {
    pub name: String,
    pub description: String,
    pub priority: i32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    Current(BTreeMap<String, CatalogEntry>),
    DescriptionsOnly(BTreeMap<String, String>),
}

/// Usable groups, swapped whole on reload
#[derive(Debug)]
pub struct GroupCatalog {
    groups: RwLock<Arc<BTreeMap<String, CatalogEntry>>>,
}

impl Default for GroupCatalog {
    fn default() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            DEFAULT_GROUP.to_string(),
            CatalogEntry {
                description: "Default group".to_string(),
                priority: DEFAULT_GROUP_PRIORITY,
            },
        );
        groups.insert(
            "vip".to_string(),
            CatalogEntry {
                description: "VIP group".to_string(),
                priority: 5,
            },
        );
        Self::from_entries(groups)
    }
}

impl GroupCatalog {
    pub fn from_entries(groups: BTreeMap<String, CatalogEntry>) -> Self {
        Self {
            groups: RwLock::new(Arc::new(groups)),
        }
    }

    /// Parse either document form
    pub fn parse(raw: &str) -> GatewayResult<BTreeMap<String, CatalogEntry>> {
        let document: CatalogDocument =
            serde_json::from_str(raw).map_err(|e| GatewayError::Json {
                message: format!("Invalid group catalog: {}", e),
            })?;

        Ok(match document {
            CatalogDocument::Current(groups) => groups,
            CatalogDocument::DescriptionsOnly(descriptions) => descriptions
                .into_iter()
                .zip((1..).map(|step| step * LEGACY_PRIORITY_STEP))
                .map(|((name, description), priority)| {
                    (name, CatalogEntry { description, priority })
                })
                .collect(),
        })
    }

    /// Replace the catalog; a document that does not parse leaves it untouched
    pub fn reload_from_str(&self, raw: &str) -> GatewayResult<usize> {
        let groups = Self::parse(raw)?;
        let count = groups.len();
        *self.groups.write() = Arc::new(groups);
        info!(groups = count, "Group catalog updated");
        Ok(count)
    }

    pub fn snapshot(&self) -> Arc<BTreeMap<String, CatalogEntry>> {
        Arc::clone(&self.groups.read())
    }

    pub fn to_json(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self.snapshot().as_ref())?)
    }

    pub fn contains(&self, group: &str) -> bool {
        self.groups.read().contains_key(group)
    }

    /// Catalog description, or the name itself for unlisted groups
    pub fn description(&self, group: &str) -> String {
        self.groups
            .read()
            .get(group)
            .map_or_else(|| group.to_string(), |entry| entry.description.clone())
    }

    pub fn priority(&self, group: &str) -> i32 {
        self.groups
            .read()
            .get(group)
            .map_or(UNLISTED_GROUP_PRIORITY, |entry| entry.priority)
    }

    /// Change one listed group's priority; unlisted groups are left alone
    pub fn set_priority(&self, group: &str, priority: i32) -> bool {
        let mut guard = self.groups.write();
        if !guard.contains_key(group) {
            return false;
        }
        if let Some(entry) = Arc::make_mut(&mut guard).get_mut(group) {
            entry.priority = priority;
        }
        true
    }

    /// Groups offered to a caller whose own group is `user_group`, by priority
    ///
    /// The caller's group is included even when unlisted, and `default` is
    /// always present. Equal priorities sort by name.
    pub fn sorted_for(&self, user_group: &str) -> Vec<UsableGroup> {
        let snapshot = self.snapshot();
        let mut groups: Vec<UsableGroup> = snapshot
            .iter()
            .map(|(name, entry)| UsableGroup {
                name: name.clone(),
                description: entry.description.clone(),
                priority: entry.priority,
            })
            .collect();

        if !user_group.is_empty() && !snapshot.contains_key(user_group) {
            groups.push(UsableGroup {
                name: user_group.to_string(),
                description: "User group".to_string(),
                priority: UNLISTED_GROUP_PRIORITY,
            });
        }
        if !groups.iter().any(|group| group.name == DEFAULT_GROUP) {
            groups.push(UsableGroup {
                name: DEFAULT_GROUP.to_string(),
                description: "Default group".to_string(),
                priority: DEFAULT_GROUP_PRIORITY,
            });
        }

        groups.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        groups
    }
}
