//! Credential loading, group resolution and write-back.

use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{CredentialCache, CredentialStore, RoutingCredential};
use crate::core::error::GatewayResult;
use crate::observability::metrics as gateway_metrics;

/// Loads credentials and picks their routing group
#[derive(Clone)]
pub struct CredentialRouter {
    store: Arc<dyn CredentialStore>,
    cache: Option<Arc<CredentialCache>>,
}

impl CredentialRouter {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store, cache: None }
    }

    pub fn with_cache(mut self, cache: Arc<CredentialCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Look a credential up by its secret
    ///
    /// The shared cache is consulted first; a miss or a cache failure falls
    /// through to the store, after which the cache is refilled in the
    /// background. Legacy comma-joined groups are upgraded on both paths.
    pub async fn load(&self, key: &str) -> GatewayResult<Option<RoutingCredential>> {
        if let Some(cache) = &self.cache {
            match cache.get(key).await {
                Ok(Some(stored)) => {
                    let mut credential = RoutingCredential::from_stored(stored);
                    self.migrate_if_legacy(&mut credential);
                    return Ok(Some(credential));
                }
                Ok(None) => debug!("Credential cache miss"),
                Err(e) => warn!(error = %e, "Credential cache read failed, using store"),
            }
        }

        let Some(stored) = self.store.find_by_key(key).await? else {
            return Ok(None);
        };

        let mut credential = RoutingCredential::from_stored(stored);
        if !self.migrate_if_legacy(&mut credential) {
            self.refill_cache(&credential);
        }
        Ok(Some(credential))
    }

    /// Group the credential should route through
    ///
    /// A legacy credential is upgraded in place before resolving; its
    /// persistence runs in the background and is not awaited. Outside a
    /// tokio runtime the write-back is skipped and the next load retries it.
    pub fn resolve_group(&self, credential: &mut RoutingCredential) -> String {
        self.migrate_if_legacy(credential);
        credential.current_group().to_string()
    }

    pub async fn set_groups(
        &self,
        credential: &mut RoutingCredential,
        groups: Vec<String>,
    ) -> GatewayResult<()> {
        credential.set_groups(groups);
        self.persist(credential).await
    }

    /// Switch one entry off and persist; returns whether anything changed
    pub async fn disable_group_at(
        &self,
        credential: &mut RoutingCredential,
        index: usize,
    ) -> GatewayResult<bool> {
        if !credential.disable_group_at(index) {
            return Ok(false);
        }
        self.persist(credential).await?;
        Ok(true)
    }

    pub async fn enable_group_at(
        &self,
        credential: &mut RoutingCredential,
        index: usize,
    ) -> GatewayResult<bool> {
        if !credential.enable_group_at(index) {
            return Ok(false);
        }
        self.persist(credential).await?;
        Ok(true)
    }

    /// Write to the store, then refresh the cache
    ///
    /// Store failures propagate; cache failures are only logged.
    pub async fn persist(&self, credential: &RoutingCredential) -> GatewayResult<()> {
        let stored = credential.to_stored()?;
        self.store.save(&stored).await?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(&stored).await {
                warn!(credential_id = stored.id, error = %e, "Failed to refresh credential cache");
            }
        }
        Ok(())
    }

    fn migrate_if_legacy(&self, credential: &mut RoutingCredential) -> bool {
        if !credential.migrate_legacy() {
            return false;
        }

        info!(
            credential_id = credential.id,
            groups = ?credential.all_groups(),
            "Migrated legacy credential groups to multi-group form"
        );
        gateway_metrics::credential_migrated();

        let router = self.clone();
        let migrated = credential.clone();
        spawn_background("persist migrated credential", async move {
            if let Err(e) = router.persist(&migrated).await {
                warn!(credential_id = migrated.id, error = %e, "Failed to persist migrated credential");
            }
        });
        true
    }

    fn refill_cache(&self, credential: &RoutingCredential) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let stored = match credential.to_stored() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(credential_id = credential.id, error = %e, "Cannot encode credential for cache");
                return;
            }
        };
        spawn_background("refill credential cache", async move {
            if let Err(e) = cache.put(&stored).await {
                warn!(credential_id = stored.id, error = %e, "Failed to refill credential cache");
            }
        });
    }
}

/// Run `task` on the current runtime, or drop it when there is none
fn spawn_background<F>(what: &'static str, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => warn!(task = what, "No tokio runtime, skipping background write"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::credential::{GroupAssignment, MemoryCredentialStore, StoredCredential};
    use std::time::Duration;

    fn legacy(key: &str, group: &str) -> StoredCredential {
        StoredCredential {
            id: 1,
            user_id: 1,
            key: key.to_string(),
            name: String::new(),
            status: 1,
            group: group.to_string(),
            group_info: None,
        }
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_resolve_group_migrates_and_persists() {
        let store = Arc::new(MemoryCredentialStore::new());
        let router = CredentialRouter::new(store.clone());

        let mut credential = RoutingCredential::from_stored(legacy("sk-1", "a, b , c"));
        assert_eq!(router.resolve_group(&mut credential), "a");
        assert_eq!(credential.all_groups(), vec!["a", "b", "c"]);

        assert!(eventually(|| store.get("sk-1").map_or(false, |s| s.group_info.is_some())).await);
        let persisted = store.get("sk-1").unwrap();
        assert_eq!(persisted.group, "a");
    }

    #[tokio::test]
    async fn test_load_from_store_refills_cache() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.insert(legacy("sk-2", "default"));
        let cache = Arc::new(
            CredentialCache::new(Arc::new(MemoryCache::new()), "secret", Duration::from_secs(60)).unwrap(),
        );
        let router = CredentialRouter::new(store).with_cache(cache.clone());

        let credential = router.load("sk-2").await.unwrap().unwrap();
        assert_eq!(credential.groups, GroupAssignment::flat("default"));

        let mut cached = None;
        for _ in 0..100 {
            cached = cache.get("sk-2").await.unwrap();
            if cached.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(cached.map(|c| c.group), Some("default".to_string()));
    }

    #[tokio::test]
    async fn test_toggles_persist_only_on_change() {
        let store = Arc::new(MemoryCredentialStore::new());
        let router = CredentialRouter::new(store.clone());
        let mut credential = RoutingCredential::new(3, 3, "sk-3", GroupAssignment::default());

        router
            .set_groups(&mut credential, vec!["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        assert!(router.disable_group_at(&mut credential, 0).await.unwrap());
        assert!(!router.disable_group_at(&mut credential, 5).await.unwrap());
        assert_eq!(router.resolve_group(&mut credential), "B");

        let reloaded = RoutingCredential::from_stored(store.get("sk-3").unwrap());
        assert_eq!(reloaded.current_group(), "B");
    }

    #[test]
    fn test_resolve_group_outside_runtime() {
        let store = Arc::new(MemoryCredentialStore::new());
        let router = CredentialRouter::new(store.clone());

        let mut credential = RoutingCredential::from_stored(legacy("sk-4", "a, b , c"));
        assert_eq!(router.resolve_group(&mut credential), "a");
        assert!(credential.groups.is_multi());
        // Nothing could run the write-back
        assert!(store.get("sk-4").is_none());
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let router = CredentialRouter::new(Arc::new(MemoryCredentialStore::new()));
        assert!(router.load("nope").await.unwrap().is_none());
    }
}
