//! Credential mirror in the shared cache.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::StoredCredential;
use crate::cache::{CacheError, CacheResult, SharedCache};
use crate::core::error::{GatewayError, GatewayResult};

type HmacSha256 = Hmac<Sha256>;

/// Credentials cached as hashes under `token:{hex(HMAC-SHA256(secret, key))}`
///
/// The secret itself never reaches the cache.
pub struct CredentialCache {
    cache: Arc<dyn SharedCache>,
    mac: HmacSha256,
    ttl: Duration,
}

impl CredentialCache {
    pub fn new(cache: Arc<dyn SharedCache>, hmac_secret: &str, ttl: Duration) -> GatewayResult<Self> {
        let mac = HmacSha256::new_from_slice(hmac_secret.as_bytes())
            .map_err(|e| GatewayError::config(format!("Invalid HMAC key: {}", e)))?;
        Ok(Self { cache, mac, ttl })
    }

    pub fn cache_key(&self, key: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(key.as_bytes());
        format!("token:{}", hex::encode(mac.finalize().into_bytes()))
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<StoredCredential>> {
        let cache_key = self.cache_key(key);
        let fields = self.cache.hash_get_all(&cache_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_fields(&cache_key, key, &fields).map(Some)
    }

    pub async fn put(&self, credential: &StoredCredential) -> CacheResult<()> {
        let cache_key = self.cache_key(&credential.key);
        self.cache
            .hash_set_all(&cache_key, &encode_fields(credential), self.ttl)
            .await
    }

    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.cache.delete(&self.cache_key(key)).await
    }
}

fn encode_fields(credential: &StoredCredential) -> Vec<(String, String)> {
    let mut fields = vec![
        ("id".to_string(), credential.id.to_string()),
        ("user_id".to_string(), credential.user_id.to_string()),
        ("name".to_string(), credential.name.clone()),
        ("status".to_string(), credential.status.to_string()),
        ("group".to_string(), credential.group.clone()),
    ];
    if let Some(info) = &credential.group_info {
        fields.push(("group_info".to_string(), info.clone()));
    }
    fields
}

fn decode_fields(
    cache_key: &str,
    key: &str,
    fields: &HashMap<String, String>,
) -> CacheResult<StoredCredential> {
    let number = |name: &str| -> CacheResult<i64> {
        let raw = fields.get(name).ok_or_else(|| CacheError::Malformed {
            key: cache_key.to_string(),
            reason: format!("missing field {}", name),
        })?;
        raw.parse().map_err(|_| CacheError::Malformed {
            key: cache_key.to_string(),
            reason: format!("field {} is not a number: {}", name, raw),
        })
    };

    let status = i32::try_from(number("status")?).map_err(|_| CacheError::Malformed {
        key: cache_key.to_string(),
        reason: "status out of range".to_string(),
    })?;

    Ok(StoredCredential {
        id: number("id")?,
        user_id: number("user_id")?,
        key: key.to_string(),
        name: fields.get("name").cloned().unwrap_or_default(),
        status,
        group: fields.get("group").cloned().unwrap_or_default(),
        group_info: fields.get("group_info").cloned(),
    })
}
