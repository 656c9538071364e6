//! Staging of intermediate results between the map and reduce phases.
//!
//! The coordinator is the only writer, but a single map task may append to
//! many keys and many map tasks may append to the same key, so a backend must
//! at least offer atomic append-to-collection-by-key. [`InMemoryStore`] is the
//! default; a Redis backed store is available behind the `redis` feature.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::{common::KeyValue, config::Config};

#[cfg(feature = "redis")]
pub mod redis;

/// A multimap from serialized intermediate keys to serialized values.
///
/// The order of values under a key, and the order of keys, is unspecified.
#[async_trait]
pub trait IntermediateStore: Send + Sync {
    async fn append(&mut self, key: Bytes, value: Bytes) -> Result<()>;

    /// Append every pair of one completed map task.
    async fn extend(&mut self, pairs: Vec<KeyValue>) -> Result<()> {
        for KeyValue { key, value } in pairs {
            self.append(key, value).await?;
        }
        Ok(())
    }

    /// Every value appended under `key`; empty if there are none.
    async fn get(&mut self, key: &[u8]) -> Result<Vec<Bytes>>;

    async fn keys(&mut self) -> Result<Vec<Bytes>>;

    async fn clear(&mut self) -> Result<()>;
}

/// Select the store named by the configuration.
pub async fn from_config(config: &Config) -> Result<Box<dyn IntermediateStore>> {
    match &config.redis_url {
        None => Ok(Box::<InMemoryStore>::default()),
        #[cfg(feature = "redis")]
        Some(url) => Ok(Box::new(self::redis::RedisStore::connect(url).await?)),
        #[cfg(not(feature = "redis"))]
        Some(_) => anyhow::bail!("a Redis URL was given, but the `redis` feature is disabled"),
    }
}

#[derive(Default, Debug)]
pub struct InMemoryStore {
    entries: HashMap<Bytes, Vec<Bytes>>,
}

#[async_trait]
impl IntermediateStore for InMemoryStore {
    async fn append(&mut self, key: Bytes, value: Bytes) -> Result<()> {
        self.entries.entry(key).or_default().push(value);
        Ok(())
    }

    async fn get(&mut self, key: &[u8]) -> Result<Vec<Bytes>> {
        Ok(self.entries.get(key).cloned().unwrap_or_default())
    }

    async fn keys(&mut self) -> Result<Vec<Bytes>> {
        Ok(self.entries.keys().cloned().collect())
    }

    async fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}
