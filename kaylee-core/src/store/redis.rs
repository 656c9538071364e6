//! Redis backed [`IntermediateStore`].
//!
//! Values live in one Redis list per intermediate key (`RPUSH` is an atomic
//! append), and a set indexes the keys. All entries of one store share a
//! random namespace, so concurrent jobs on the same server do not collide.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::info;

use super::IntermediateStore;
use crate::common::{random_token, KeyValue};

const NAMESPACE_LEN: usize = 12;

pub struct RedisStore {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        let namespace = format!("kaylee:{}", random_token(NAMESPACE_LEN));
        info!(%namespace, "staging intermediate results in Redis");
        Ok(Self { conn, namespace })
    }

    fn index_key(&self) -> String {
        format!("{}:keys", self.namespace)
    }

    fn list_key(&self, key: &[u8]) -> Vec<u8> {
        let mut list = format!("{}:values:", self.namespace).into_bytes();
        list.extend_from_slice(key);
        list
    }
}

#[async_trait]
impl IntermediateStore for RedisStore {
    async fn append(&mut self, key: Bytes, value: Bytes) -> Result<()> {
        self.extend(vec![KeyValue { key, value }]).await
    }

    async fn extend(&mut self, pairs: Vec<KeyValue>) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }

        let index = self.index_key();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for KeyValue { key, value } in &pairs {
            pipe.sadd(&index, &key[..]).ignore();
            pipe.rpush(self.list_key(key), &value[..]).ignore();
        }
        let () = pipe.query_async(&mut self.conn).await?;
        Ok(())
    }

    async fn get(&mut self, key: &[u8]) -> Result<Vec<Bytes>> {
        let list = self.list_key(key);
        let values: Vec<Vec<u8>> = self.conn.lrange(list, 0, -1).await?;
        Ok(values.into_iter().map(Bytes::from).collect())
    }

    async fn keys(&mut self) -> Result<Vec<Bytes>> {
        let index = self.index_key();
        let keys: Vec<Vec<u8>> = self.conn.smembers(index).await?;
        Ok(keys.into_iter().map(Bytes::from).collect())
    }

    async fn clear(&mut self) -> Result<()> {
        let keys = self.keys().await?;
        let mut doomed: Vec<Vec<u8>> = keys.iter().map(|key| self.list_key(key)).collect();
        doomed.push(self.index_key().into_bytes());
        let _: usize = self.conn.del(doomed).await?;
        Ok(())
    }
}
