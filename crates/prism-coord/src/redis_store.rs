use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::{CoordResult, CoordinationStore};

/// Redis-backed coordination store. Counters rely on `INCR` + `EXPIRE NX`
/// so concurrent workers see serialized values and the window TTL is set
/// exactly once per key incarnation.
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn connect(url: &str) -> CoordResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }

    async fn conn(&self) -> CoordResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> CoordResult<i64> {
        let mut conn = self.conn().await?;
        // Lua keeps INCR + first-hit EXPIRE atomic across workers.
        let script = redis::Script::new(
            r#"
            local count = redis.call('INCR', KEYS[1])
            if count == 1 then
              redis.call('EXPIRE', KEYS[1], ARGV[1])
            end
            return count
            "#,
        );
        let count: i64 = script
            .key(key)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get_i64(&self, key: &str) -> CoordResult<Option<i64>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn get_string(&self, key: &str) -> CoordResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CoordResult<()> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> CoordResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> CoordResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut out = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            out.extend(keys);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(out)
    }
}
