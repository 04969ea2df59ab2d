//! # Credential Router
//!
//! Resolves a caller credential into the routing group its request should
//! use. A credential either names one group (the flat form) or carries an
//! ordered list of groups with per-entry availability; the first available
//! entry wins.
//!
//! Older credentials stored several groups as one comma-joined flat value.
//! Those are upgraded to the multi-group form the first time they are read,
//! and the upgraded credential is written back in the background.
//!
//! Credentials are read through an optional shared cache (keyed by an
//! HMAC of the secret) in front of a [`CredentialStore`].
//!
//! [`GroupCatalog`] lists the groups callers may choose from, with a
//! description and a sort priority for each.

mod cache;
mod catalog;
mod groups;
mod router;

pub use cache::CredentialCache;
pub use catalog::{
    CatalogEntry, GroupCatalog, UsableGroup, DEFAULT_GROUP, DEFAULT_GROUP_PRIORITY,
    UNLISTED_GROUP_PRIORITY,
};
pub use groups::{
    GroupAssignment, GroupInfo, MultiGroup, LEGACY_DELIMITER, STATUS_DISABLED, STATUS_ENABLED,
};
pub use router::CredentialRouter;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::error::GatewayResult;

/// Credential exactly as the persistence layer holds it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredential {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    pub status: i32,
    /// Flat group column; may hold a legacy comma-joined list
    pub group: String,
    /// Serialized [`GroupInfo`], absent for flat credentials
    pub group_info: Option<String>,
}

/// Credential with its group assignment decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingCredential {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: String,
    pub status: i32,
    pub groups: GroupAssignment,
}

impl RoutingCredential {
    pub fn new(id: i64, user_id: i64, key: impl Into<String>, groups: GroupAssignment) -> Self {
        Self {
            id,
            user_id,
            key: key.into(),
            name: String::new(),
            status: STATUS_ENABLED,
            groups,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == STATUS_ENABLED
    }

    pub fn flat_group(&self) -> &str {
        self.groups.flat_group()
    }

    /// Group this credential routes through right now
    pub fn current_group(&self) -> &str {
        self.groups.resolve()
    }

    pub fn all_groups(&self) -> Vec<String> {
        self.groups.all_groups()
    }

    pub fn set_groups(&mut self, groups: Vec<String>) {
        self.groups.set_groups(groups);
    }

    pub fn disable_group_at(&mut self, index: usize) -> bool {
        self.groups.disable_at(index)
    }

    pub fn enable_group_at(&mut self, index: usize) -> bool {
        self.groups.enable_at(index)
    }

    pub fn migrate_legacy(&mut self) -> bool {
        self.groups.migrate_legacy()
    }

    /// Decode a stored credential
    ///
    /// An unreadable `group_info` blob falls back to the flat group.
    pub fn from_stored(stored: StoredCredential) -> Self {
        let info = stored
            .group_info
            .as_deref()
            .filter(|blob| !blob.trim().is_empty())
            .and_then(|blob| match serde_json::from_str::<GroupInfo>(blob) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(
                        credential_id = stored.id,
                        error = %e,
                        "Corrupted group_info, falling back to flat group"
                    );
                    None
                }
            });

        Self {
            groups: GroupAssignment::from_persisted(&stored.group, info),
            id: stored.id,
            user_id: stored.user_id,
            key: stored.key,
            name: stored.name,
            status: stored.status,
        }
    }

    pub fn to_stored(&self) -> GatewayResult<StoredCredential> {
        let (group, info) = self.groups.to_persisted();
        let group_info = info.map(|info| serde_json::to_string(&info)).transpose()?;
        Ok(StoredCredential {
            id: self.id,
            user_id: self.user_id,
            key: self.key.clone(),
            name: self.name.clone(),
            status: self.status,
            group,
            group_info,
        })
    }
}

/// Persistence collaborator for credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_key(&self, key: &str) -> GatewayResult<Option<StoredCredential>>;

    async fn save(&self, credential: &StoredCredential) -> GatewayResult<()>;
}

/// In-process credential store keyed by credential secret
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: DashMap<String, StoredCredential>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential: StoredCredential) {
        self.credentials.insert(credential.key.clone(), credential);
    }

    pub fn get(&self, key: &str) -> Option<StoredCredential> {
        self.credentials.get(key).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_key(&self, key: &str) -> GatewayResult<Option<StoredCredential>> {
        Ok(self.get(key))
    }

    async fn save(&self, credential: &StoredCredential) -> GatewayResult<()> {
        self.insert(credential.clone());
        Ok(())
    }
}
