//! Optional persistence layer.
//!
//! The risk ledger, settlement map and FCR monitor are process-local by default (the
//! `DashMap`-backed state in `risk.rs`/`settlement.rs`/`fcr.rs`). This module defines the
//! key-value surface those components would be backed by for horizontal scale, using the
//! key layout from spec.md §6, plus a short-lived distributed lock primitive for per-wallet
//! critical sections across processes. The default implementation is in-memory; the
//! `redis-store` feature swaps in a real `redis` connection, mirroring how the teacher
//! gates its OpenTelemetry export behind a Cargo feature rather than branching at runtime.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("persistence backend error: {0}")]
    Backend(String),
    #[error("lock {0} is already held")]
    LockHeld(String),
}

/// A key-value surface over the layout in spec.md §6: `pending:{addr}`, `daily:{addr}:{date}`,
/// `tier:{addr}`, `firstseen:{addr}`, `settlement:{id}`, `settlements:pending`,
/// `voucher:{id}:{buyer}:{seller}`, `vouchers:buyer:{addr}`. Values are opaque bytes — callers
/// own their own (de)serialization, matching how `redis` itself treats values.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn set_add(&self, set_key: &str, member: String) -> Result<(), StoreError>;
    async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError>;

    /// Acquires `lock:{resource}` for at most `ttl`, returning a random token the holder
    /// must present to `unlock`. Returns `Err(LockHeld)` if already held by someone else.
    async fn lock(&self, resource: &str, ttl: Duration) -> Result<String, StoreError>;

    /// Releases the lock only if `token` matches the current holder (check-then-delete).
    async fn unlock(&self, resource: &str, token: &str) -> Result<(), StoreError>;
}

pub fn key_pending(addr: &str) -> String {
    format!("pending:{addr}")
}

pub fn key_daily(addr: &str, date: &str) -> String {
    format!("daily:{addr}:{date}")
}

pub fn key_tier(addr: &str) -> String {
    format!("tier:{addr}")
}

pub fn key_first_seen(addr: &str) -> String {
    format!("firstseen:{addr}")
}

pub fn key_settlement(id: &str) -> String {
    format!("settlement:{id}")
}

pub const KEY_SETTLEMENTS_PENDING: &str = "settlements:pending";

pub fn key_voucher(id: &str, buyer: &str, seller: &str) -> String {
    format!("voucher:{id}:{buyer}:{seller}")
}

pub fn key_vouchers_by_buyer(addr: &str) -> String {
    format!("vouchers:buyer:{addr}")
}

pub const LOCK_TTL: Duration = Duration::from_secs(30);

/// Process-local implementation, the default when no `PERSISTENCE_URL` is configured.
/// Every facilitator component already keeps its authoritative state in its own
/// `DashMap`; this store exists so the same `Store` trait object can be handed to code
/// that wants to survive a restart without requiring every component to know whether
/// persistence is enabled.
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use rand::Rng;
    use std::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryStore {
        values: DashMap<String, Vec<u8>>,
        sets: DashMap<String, RwLock<Vec<String>>>,
        locks: DashMap<String, String>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            MemoryStore::default()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.values.get(key).map(|v| v.clone()))
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            self.values.insert(key.to_string(), value);
            Ok(())
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.values.remove(key);
            Ok(())
        }

        async fn set_add(&self, set_key: &str, member: String) -> Result<(), StoreError> {
            let entry = self
                .sets
                .entry(set_key.to_string())
                .or_insert_with(|| RwLock::new(Vec::new()));
            let mut members = entry.write().expect("lock poisoned");
            if !members.contains(&member) {
                members.push(member);
            }
            Ok(())
        }

        async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError> {
            Ok(self
                .sets
                .get(set_key)
                .map(|entry| entry.read().expect("lock poisoned").clone())
                .unwrap_or_default())
        }

        async fn lock(&self, resource: &str, _ttl: Duration) -> Result<String, StoreError> {
            let token: String = {
                let mut rng = rand::rng();
                (0..16).map(|_| rng.random_range(b'a'..=b'z') as char).collect()
            };
            let key = format!("lock:{resource}");
            match self.locks.entry(key) {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    Err(StoreError::LockHeld(resource.to_string()))
                }
                dashmap::mapref::entry::Entry::Vacant(entry) => {
                    entry.insert(token.clone());
                    Ok(token)
                }
            }
        }

        async fn unlock(&self, resource: &str, token: &str) -> Result<(), StoreError> {
            let key = format!("lock:{resource}");
            if let Some(held) = self.locks.get(&key) {
                if held.value() == token {
                    drop(held);
                    self.locks.remove(&key);
                }
            }
            Ok(())
        }
    }
}

#[cfg(feature = "redis-store")]
pub mod redis_store {
    use super::*;
    use rand::Rng;
    use redis::AsyncCommands;
    use redis::aio::ConnectionManager;

    /// Redis-backed [`Store`], connected eagerly at construction (mirrors the teacher's
    /// provider connections, which fail fast rather than lazily on first use).
    #[derive(Clone)]
    pub struct RedisStore {
        conn: ConnectionManager,
        prefix: String,
    }

    impl RedisStore {
        pub async fn connect(url: &str, prefix: String) -> Result<Self, StoreError> {
            let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
            let conn = client
                .get_connection_manager()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(RedisStore { conn, prefix })
        }

        fn namespaced(&self, key: &str) -> String {
            format!("{}:{}", self.prefix, key)
        }
    }

    #[async_trait]
    impl Store for RedisStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            let mut conn = self.conn.clone();
            conn.get(self.namespaced(key))
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            let mut conn = self.conn.clone();
            conn.set(self.namespaced(key), value)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            let mut conn = self.conn.clone();
            conn.del(self.namespaced(key))
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        }

        async fn set_add(&self, set_key: &str, member: String) -> Result<(), StoreError> {
            let mut conn = self.conn.clone();
            conn.sadd(self.namespaced(set_key), member)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        }

        async fn set_members(&self, set_key: &str) -> Result<Vec<String>, StoreError> {
            let mut conn = self.conn.clone();
            conn.smembers(self.namespaced(set_key))
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))
        }

        async fn lock(&self, resource: &str, ttl: Duration) -> Result<String, StoreError> {
            let token: String = {
                let mut rng = rand::rng();
                (0..16).map(|_| rng.random_range(b'a'..=b'z') as char).collect()
            };
            let mut conn = self.conn.clone();
            let key = self.namespaced(&format!("lock:{resource}"));
            let acquired: bool = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            if acquired {
                Ok(token)
            } else {
                Err(StoreError::LockHeld(resource.to_string()))
            }
        }

        async fn unlock(&self, resource: &str, token: &str) -> Result<(), StoreError> {
            const RELEASE_SCRIPT: &str = r#"
                if redis.call("get", KEYS[1]) == ARGV[1] then
                    return redis.call("del", KEYS[1])
                else
                    return 0
                end
            "#;
            let mut conn = self.conn.clone();
            let key = self.namespaced(&format!("lock:{resource}"));
            let script = redis::Script::new(RELEASE_SCRIPT);
            script
                .key(key)
                .arg(token)
                .invoke_async::<i64>(&mut conn)
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        }
    }
}

/// Picks the configured backend: `redis-store` when `url` is `Some` and the feature is
/// enabled, otherwise the in-memory default.
pub async fn connect(url: Option<&str>, prefix: &str) -> Result<Arc<dyn Store>, StoreError> {
    match url {
        #[cfg(feature = "redis-store")]
        Some(url) => {
            let store = redis_store::RedisStore::connect(url, prefix.to_string()).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "redis-store"))]
        Some(_) => Err(StoreError::Backend(
            "persistence url configured but redis-store feature is disabled".to_string(),
        )),
        None => Ok(Arc::new(memory::MemoryStore::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryStore;
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let store = MemoryStore::new();
        store.set(&key_tier("0xabc"), b"verified".to_vec()).await.unwrap();
        assert_eq!(store.get(&key_tier("0xabc")).await.unwrap(), Some(b"verified".to_vec()));
    }

    #[tokio::test]
    async fn set_add_is_idempotent() {
        let store = MemoryStore::new();
        store.set_add(&key_vouchers_by_buyer("0xabc"), "voucher-1".to_string()).await.unwrap();
        store.set_add(&key_vouchers_by_buyer("0xabc"), "voucher-1".to_string()).await.unwrap();
        let members = store.set_members(&key_vouchers_by_buyer("0xabc")).await.unwrap();
        assert_eq!(members, vec!["voucher-1".to_string()]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let token = store.lock("settlement:1", LOCK_TTL).await.unwrap();
        let second = store.lock("settlement:1", LOCK_TTL).await;
        assert!(matches!(second, Err(StoreError::LockHeld(_))));
        store.unlock("settlement:1", &token).await.unwrap();
        assert!(store.lock("settlement:1", LOCK_TTL).await.is_ok());
    }
}
