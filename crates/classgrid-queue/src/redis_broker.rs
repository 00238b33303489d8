//! Redis-backed broker with visibility-timeout redelivery.
//!
//! # Key layout
//!
//! For a queue `q` under prefix `p`:
//!
//! - `p:q:ready`: list of visible message ids (LPUSH on send, RPOP on claim)
//! - `p:q:inflight`: sorted set of claimed ids scored by visibility deadline
//!   (epoch millis)
//! - `p:msg:{id}`: hash with `body`, `attributes` (JSON) and `receive_count`
//! - `p:seq`: message id counter
//!
//! Claiming runs as one Lua script so that reclaiming expired leases and
//! moving ids into the in-flight set is atomic: a crashed receiver can never
//! strand a message outside both structures. Redis has no blocking variant of
//! that script, so long-poll is emulated by re-running the claim every
//! `poll_interval` until the wait elapses.
//!
//! A receipt handle is `<id>@<receive_count>`, unique per delivery. Ack is a
//! Lua script that deletes the message only while that delivery still holds
//! the lease, so a holder whose lease expired and was reclaimed cannot
//! delete the newer delivery.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use tokio::time::Instant;
use tracing::debug;

use classgrid_core::Attributes;

use crate::{Message, Queue, QueueError, QueueResult, ReceiptHandle};

const CLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[3])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('RPUSH', KEYS[1], id)
end
local claimed = {}
for i = 1, tonumber(ARGV[2]) do
  local id = redis.call('RPOP', KEYS[1])
  if not id then break end
  redis.call('ZADD', KEYS[2], ARGV[1], id)
  redis.call('HINCRBY', ARGV[4] .. id, 'receive_count', 1)
  table.insert(claimed, id)
end
return claimed
"#;

const DEPTH_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('RPUSH', KEYS[1], id)
end
return redis.call('LLEN', KEYS[1])
"#;

const ACK_SCRIPT: &str = r#"
if not redis.call('ZSCORE', KEYS[2], ARGV[1]) then return 0 end
if redis.call('HGET', ARGV[3], 'receive_count') ~= ARGV[2] then return 0 end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('LREM', KEYS[1], 0, ARGV[1])
redis.call('DEL', ARGV[3])
return 1
"#;

/// Redis key names for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub ready: String,
    pub in_flight: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            ready: format!("{prefix}:{queue}:ready"),
            in_flight: format!("{prefix}:{queue}:inflight"),
        }
    }
}

/// Broker storing queues in Redis.
#[derive(Clone)]
pub struct RedisBroker {
    /// Connection manager (reconnects automatically).
    redis: ConnectionManager,
    prefix: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    claim: Script,
    depth: Script,
    ack: Script,
}

impl RedisBroker {
    /// Connect to Redis.
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Backend(format!("invalid redis url: {e}")))?;
        let redis = ConnectionManager::new(client).await?;
        debug!(%redis_url, %prefix, "redis broker connected");
        Ok(Self {
            redis,
            prefix: prefix.to_string(),
            visibility_timeout,
            poll_interval,
            claim: Script::new(CLAIM_SCRIPT),
            depth: Script::new(DEPTH_SCRIPT),
            ack: Script::new(ACK_SCRIPT),
        })
    }

    fn message_prefix(&self) -> String {
        format!("{}:msg:", self.prefix)
    }

    fn message_key(&self, id: &str) -> String {
        format!("{}{id}", self.message_prefix())
    }

    async fn claim_once(&self, keys: &QueueKeys, max_messages: usize) -> QueueResult<Vec<Message>> {
        let mut conn = self.redis.clone();
        let now = epoch_millis();
        let deadline = now + self.visibility_timeout.as_millis() as u64;

        let ids: Vec<String> = self
            .claim
            .key(&keys.ready)
            .key(&keys.in_flight)
            .arg(deadline)
            .arg(max_messages)
            .arg(now)
            .arg(self.message_prefix())
            .invoke_async(&mut conn)
            .await?;

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(self.message_key(&id))
                .query_async(&mut conn)
                .await?;
            if !fields.contains_key("body") {
                // Acked by a previous holder between claim and read.
                let _: () = redis::cmd("ZREM")
                    .arg(&keys.in_flight)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await?;
                debug!(message_id = %id, "claimed message vanished, skipping");
                continue;
            }
            messages.push(decode_message(&id, fields)?);
        }
        Ok(messages)
    }
}

#[async_trait]
impl Queue for RedisBroker {
    async fn send(&self, queue: &str, body: &str, attributes: &Attributes) -> QueueResult<String> {
        let keys = QueueKeys::new(&self.prefix, queue);
        let mut conn = self.redis.clone();

        let seq: u64 = redis::cmd("INCR")
            .arg(format!("{}:seq", self.prefix))
            .query_async(&mut conn)
            .await?;
        let id = format!("m-{seq}");
        let encoded = serde_json::to_string(attributes).map_err(|e| QueueError::Malformed {
            id: id.clone(),
            reason: e.to_string(),
        })?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.message_key(&id))
            .arg("body")
            .arg(body)
            .arg("attributes")
            .arg(encoded)
            .arg("receive_count")
            .arg(0)
            .ignore()
            .cmd("LPUSH")
            .arg(&keys.ready)
            .arg(&id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(%queue, message_id = %id, "message sent");
        Ok(id)
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: usize,
        wait: Duration,
    ) -> QueueResult<Vec<Message>> {
        let keys = QueueKeys::new(&self.prefix, queue);
        let give_up_at = Instant::now() + wait;

        loop {
            let messages = self.claim_once(&keys, max_messages).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }
            let now = Instant::now();
            if now >= give_up_at {
                return Ok(messages);
            }
            tokio::time::sleep(self.poll_interval.min(give_up_at - now)).await;
        }
    }

    async fn ack(&self, queue: &str, handle: &ReceiptHandle) -> QueueResult<()> {
        let keys = QueueKeys::new(&self.prefix, queue);
        let (id, receive_count) = parse_receipt(handle)?;
        let mut conn = self.redis.clone();

        let removed: i64 = self
            .ack
            .key(&keys.ready)
            .key(&keys.in_flight)
            .arg(id)
            .arg(receive_count)
            .arg(self.message_key(id))
            .invoke_async(&mut conn)
            .await?;

        if removed == 1 {
            debug!(%queue, message_id = %id, "message acknowledged");
        } else {
            // The lease expired and the message was reclaimed; the new
            // delivery owns it now.
            debug!(%queue, %handle, "ack for unknown or expired handle ignored");
        }
        Ok(())
    }

    async fn approximate_depth(&self, queue: &str) -> QueueResult<usize> {
        let keys = QueueKeys::new(&self.prefix, queue);
        let mut conn = self.redis.clone();
        let depth: usize = self
            .depth
            .key(&keys.ready)
            .key(&keys.in_flight)
            .arg(epoch_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(depth)
    }
}

/// Build a `Message` from a message hash. The handle pins the delivery
/// through its `receive_count`.
pub fn decode_message(id: &str, fields: HashMap<String, String>) -> QueueResult<Message> {
    let malformed = |reason: String| QueueError::Malformed {
        id: id.to_string(),
        reason,
    };

    let body = fields
        .get("body")
        .cloned()
        .ok_or_else(|| malformed("missing body".to_string()))?;
    let attributes: Attributes = match fields.get("attributes") {
        Some(raw) => serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?,
        None => Attributes::new(),
    };
    let receive_count = match fields.get("receive_count") {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|e| malformed(format!("receive_count: {e}")))?,
        None => 1,
    };

    Ok(Message {
        id: id.to_string(),
        body,
        attributes,
        handle: receipt_handle(id, receive_count),
        receive_count,
    })
}

pub fn receipt_handle(id: &str, receive_count: u32) -> ReceiptHandle {
    ReceiptHandle(format!("{id}@{receive_count}"))
}

/// Split a receipt handle into the message id and its delivery count.
pub fn parse_receipt(handle: &ReceiptHandle) -> QueueResult<(&str, u32)> {
    let malformed = |reason: &str| QueueError::Malformed {
        id: handle.0.clone(),
        reason: reason.to_string(),
    };
    let (id, count) = handle
        .0
        .rsplit_once('@')
        .ok_or_else(|| malformed("receipt handle has no delivery count"))?;
    if id.is_empty() {
        return Err(malformed("receipt handle has no message id"));
    }
    let count = count
        .parse::<u32>()
        .map_err(|_| malformed("receipt handle delivery count is not a number"))?;
    Ok((id, count))
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_key_layout() {
        let keys = QueueKeys::new("classgrid", "requests");
        assert_eq!(keys.ready, "classgrid:requests:ready");
        assert_eq!(keys.in_flight, "classgrid:requests:inflight");
    }

    #[test]
    fn decode_full_message() {
        let mut fields = HashMap::new();
        fields.insert("body".to_string(), "cat.jpg".to_string());
        fields.insert(
            "attributes".to_string(),
            r#"{"FILE_NAME":"cat.jpg"}"#.to_string(),
        );
        fields.insert("receive_count".to_string(), "3".to_string());

        let msg = decode_message("m-7", fields).unwrap();
        assert_eq!(msg.id, "m-7");
        assert_eq!(msg.handle, ReceiptHandle("m-7@3".to_string()));
        assert_eq!(msg.body, "cat.jpg");
        assert_eq!(msg.attributes["FILE_NAME"], "cat.jpg");
        assert_eq!(msg.receive_count, 3);
    }

    #[test]
    fn decode_rejects_bad_attributes() {
        let mut fields = HashMap::new();
        fields.insert("body".to_string(), "cat.jpg".to_string());
        fields.insert("attributes".to_string(), "not json".to_string());
        let err = decode_message("m-1", fields).unwrap_err();
        assert!(matches!(err, QueueError::Malformed { ref id, .. } if id == "m-1"));
    }

    #[test]
    fn each_delivery_gets_its_own_handle() {
        let first = receipt_handle("m-7", 1);
        let second = receipt_handle("m-7", 2);
        assert_ne!(first, second);
        assert_eq!(parse_receipt(&first).unwrap(), ("m-7", 1));
        assert_eq!(parse_receipt(&second).unwrap(), ("m-7", 2));
    }

    #[test]
    fn bad_receipts_are_malformed() {
        for raw in ["m-7", "@2", "m-7@x", ""] {
            let err = parse_receipt(&ReceiptHandle(raw.to_string())).unwrap_err();
            assert!(matches!(err, QueueError::Malformed { .. }), "{raw:?}");
        }
    }

    #[test]
    fn decode_requires_body() {
        let err = decode_message("m-2", HashMap::new()).unwrap_err();
        assert!(matches!(err, QueueError::Malformed { .. }));
    }
}
