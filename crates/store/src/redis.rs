//! Redis-backed credential store.

use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::{
    ClientLike, HashesInterface, KeysInterface, ListInterface, SetsInterface,
};
use fred::types::Expiration;
use std::collections::HashMap;
use std::sync::Arc;
use vigil_common::{AppError, AppResult};

/// Credential store backed by Redis.
///
/// All keys are namespaced under a configurable prefix. Every fred error
/// is collapsed to [`AppError::StoreUnavailable`]; callers decide whether
/// that fails closed or surfaces as a generic setup error.
#[derive(Clone)]
pub struct RedisCredentialStore {
    redis: Arc<RedisClient>,
    prefix: String,
}

impl RedisCredentialStore {
    /// Create a store around an already-connected client.
    #[must_use]
    pub fn new(redis: Arc<RedisClient>, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
        }
    }

    /// Connect to Redis and wait for the connection to be established.
    pub async fn connect(url: &str, prefix: &str) -> AppResult<Self> {
        let config = fred::types::config::Config::from_url(url)
            .map_err(|e| AppError::Config(format!("Invalid Redis URL: {e}")))?;

        let client = RedisClient::new(config, None, None, None);
        client.connect();
        client
            .wait_for_connect()
            .await
            .map_err(|e| AppError::StoreUnavailable(e.to_string()))?;

        Ok(Self::new(Arc::new(client), prefix))
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

fn store_err(e: fred::error::Error) -> AppError {
    AppError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl super::CredentialStore for RedisCredentialStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.redis.get(self.key(key)).await.map_err(store_err)
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.redis
            .set(self.key(key), value, None, None, false)
            .await
            .map_err(store_err)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: i64) -> AppResult<()> {
        self.redis
            .set(
                self.key(key),
                value,
                Some(Expiration::EX(ttl_secs)),
                None,
                false,
            )
            .await
            .map_err(store_err)
    }

    async fn take(&self, key: &str) -> AppResult<Option<String>> {
        self.redis.getdel(self.key(key)).await.map_err(store_err)
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.redis
            .del::<(), _>(self.key(key))
            .await
            .map_err(store_err)
    }

    async fn hash_get(&self, key: &str, field: &str) -> AppResult<Option<String>> {
        self.redis
            .hget(self.key(key), field)
            .await
            .map_err(store_err)
    }

    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> AppResult<()> {
        let map: HashMap<String, String> = fields.iter().cloned().collect();
        self.redis
            .hset::<(), _, _>(self.key(key), map)
            .await
            .map_err(store_err)
    }

    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        self.redis.hgetall(self.key(key)).await.map_err(store_err)
    }

    async fn hash_delete_field(&self, key: &str, field: &str) -> AppResult<()> {
        self.redis
            .hdel::<(), _, _>(self.key(key), field)
            .await
            .map_err(store_err)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> AppResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        self.redis
            .sadd::<(), _, _>(self.key(key), members.to_vec())
            .await
            .map_err(store_err)
    }

    async fn set_remove(&self, key: &str, member: &str) -> AppResult<bool> {
        let removed: i64 = self
            .redis
            .srem(self.key(key), member)
            .await
            .map_err(store_err)?;
        Ok(removed > 0)
    }

    async fn set_contains(&self, key: &str, member: &str) -> AppResult<bool> {
        self.redis
            .sismember(self.key(key), member)
            .await
            .map_err(store_err)
    }

    async fn set_members(&self, key: &str) -> AppResult<Vec<String>> {
        self.redis.smembers(self.key(key)).await.map_err(store_err)
    }

    async fn set_len(&self, key: &str) -> AppResult<u64> {
        self.redis.scard(self.key(key)).await.map_err(store_err)
    }

    async fn list_push(&self, key: &str, value: &str) -> AppResult<()> {
        self.redis
            .lpush::<(), _, _>(self.key(key), value)
            .await
            .map_err(store_err)
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> AppResult<()> {
        self.redis
            .ltrim::<(), _>(self.key(key), start, stop)
            .await
            .map_err(store_err)
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> AppResult<Vec<String>> {
        self.redis
            .lrange(self.key(key), start, stop)
            .await
            .map_err(store_err)
    }

    async fn incr(&self, key: &str) -> AppResult<i64> {
        self.redis.incr(self.key(key)).await.map_err(store_err)
    }

    async fn expire(&self, key: &str, ttl_secs: i64) -> AppResult<()> {
        self.redis
            .expire::<(), _>(self.key(key), ttl_secs, None)
            .await
            .map_err(store_err)
    }
}
