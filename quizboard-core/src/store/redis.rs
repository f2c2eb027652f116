use super::{SharedStore, Subscription, TxOp};
use crate::{QuizError, Result};
use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;

/// Runs a batch of ops all-or-nothing.
///
/// MULTI/EXEC keeps running the remaining commands when one fails at exec
/// time, so the batch is validated inside the script before anything is
/// written. ARGV is a flat list: `expect <value>`, `zadd <score> <member>`
/// or `del`, one KEYS entry per op. Returns 0 when an expectation fails and
/// nothing was written, 1 otherwise.
const EXEC_ATOMIC_SCRIPT: &str = r#"
local ops = {}
local i = 1
local k = 1
while i <= #ARGV do
  local op = ARGV[i]
  if op == 'expect' then
    if redis.call('GET', KEYS[k]) ~= ARGV[i + 1] then
      return 0
    end
    i = i + 2
  elseif op == 'zadd' then
    local score = tonumber(ARGV[i + 1])
    if score == nil or score ~= score or score == math.huge or score == -math.huge then
      return redis.error_reply('invalid score for ' .. KEYS[k])
    end
    local kind = redis.call('TYPE', KEYS[k]).ok
    if kind ~= 'none' and kind ~= 'zset' then
      return redis.error_reply('wrong type for ' .. KEYS[k])
    end
    table.insert(ops, {'ZADD', KEYS[k], ARGV[i + 1], ARGV[i + 2]})
    i = i + 3
  elseif op == 'del' then
    table.insert(ops, {'DEL', KEYS[k]})
    i = i + 1
  else
    return redis.error_reply('unknown op ' .. op)
  end
  k = k + 1
end
for _, cmd in ipairs(ops) do
  redis.call(unpack(cmd))
end
return 1
"#;

/// Redis-backed store shared by every server process in the fleet.
pub struct RedisStore {
    client: ::redis::Client,
    manager: ConnectionManager,
    exec_script: ::redis::Script,
}

impl RedisStore {
    pub async fn new(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| QuizError::Config(format!("invalid redis url: {}", e)))?;
        let manager = ConnectionManager::new(client.clone()).await?;

        let store = Self {
            client,
            manager,
            exec_script: ::redis::Script::new(EXEC_ATOMIC_SCRIPT),
        };
        store.ping().await?;

        tracing::info!("Connected to redis store");
        Ok(store)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        ::redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await?;
        Ok(())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn exec_atomic(&self, ops: Vec<TxOp>) -> Result<bool> {
        if ops.is_empty() {
            return Ok(true);
        }

        let mut invocation = self.exec_script.prepare_invoke();
        for op in &ops {
            match op {
                TxOp::Expect { key, value } => {
                    invocation.key(key).arg("expect").arg(value);
                }
                TxOp::RankedInsert { key, member, score } => {
                    invocation.key(key).arg("zadd").arg(*score).arg(member.as_slice());
                }
                TxOp::Delete { key } => {
                    invocation.key(key).arg("del");
                }
            }
        }

        let mut conn = self.manager.clone();
        let applied = invocation
            .invoke_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| QuizError::Transaction(e.to_string()))?;
        Ok(applied == 1)
    }

    async fn range_desc(
        &self,
        key: &str,
        offset: usize,
        count: usize,
    ) -> Result<Vec<(Vec<u8>, f64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let start = isize::try_from(offset)
            .map_err(|_| QuizError::InvalidRequest(format!("offset {} out of range", offset)))?;
        let stop = start.saturating_add(isize::try_from(count).unwrap_or(isize::MAX) - 1);

        let mut conn = self.manager.clone();
        let members: Vec<(Vec<u8>, f64)> = conn.zrevrange_withscores(key, start, stop).await?;
        Ok(members)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.manager.clone();
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        tracing::debug!("Subscribed to redis channel {}", channel);

        let stream = pubsub
            .into_on_message()
            .map(|message| message.get_payload_bytes().to_vec());
        Ok(Box::pin(stream))
    }
}
