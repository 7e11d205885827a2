// bookpay/src/redis_store.rs
// Redis-backed order store. Records are stored as the JSON serde produces and
// are never re-encoded server side. Updates are compare-and-set: read, change
// in process, write back only if the stored value is still the one read.

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};

use crate::error::StoreError;
use crate::orders::{OrderRecord, OrderStore, ResourceRef, Transition};

const KEY_PREFIX: &str = "bookpay";

/// Upper bound on compare-and-set retries for one update. Each retry means
/// another writer changed the record in between, which only happens under
/// concurrent deliveries for the same order.
const MAX_CAS_ATTEMPTS: usize = 16;

// Record and requester index are written together or not at all.
const INSERT_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then return 0 end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

// Reply is "<outcome>:<record json>" with outcome in missing|stale|applied.
const COMPARE_AND_SET_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then return 'missing:' end
if raw ~= ARGV[1] then return 'stale:' .. raw end
redis.call('SET', KEYS[1], ARGV[2])
return 'applied:' .. ARGV[2]
"#;

fn order_key(tracking_id: &str) -> String {
    format!("{}:order:{}", KEY_PREFIX, tracking_id)
}

fn requester_key(resource_ref: ResourceRef, email: &str) -> String {
    format!("{}:requester:{}:{}", KEY_PREFIX, resource_ref, email)
}

#[derive(Debug, PartialEq)]
enum ScriptReply {
    Missing,
    Stale,
    Applied(OrderRecord),
}

fn parse_reply(reply: &str) -> Result<ScriptReply, StoreError> {
    let (outcome, body) = reply
        .split_once(':')
        .ok_or_else(|| StoreError::Backend(format!("unexpected script reply: {}", reply)))?;
    match outcome {
        "missing" => Ok(ScriptReply::Missing),
        "stale" => Ok(ScriptReply::Stale),
        "applied" => Ok(ScriptReply::Applied(serde_json::from_str(body)?)),
        other => Err(StoreError::Backend(format!("unexpected script outcome: {}", other))),
    }
}

#[derive(Clone)]
pub struct RedisOrderStore {
    client: redis::Client,
    insert: Script,
    compare_and_set: Script,
}

impl RedisOrderStore {
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            insert: Script::new(INSERT_SCRIPT),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Runs `change` against the current record and stores the result. The
    /// closure may refuse the change by returning an error, which is passed
    /// through untouched.
    async fn update<F>(&self, tracking_id: &str, change: F) -> Result<OrderRecord, StoreError>
    where
        F: Fn(&mut OrderRecord) -> Result<(), StoreError> + Send + Sync,
    {
        let key = order_key(tracking_id);
        let mut con = self.connection().await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let raw: Option<String> = con.get(&key).await?;
            let raw = raw.ok_or_else(|| StoreError::NotFound(tracking_id.to_string()))?;

            let mut record: OrderRecord = serde_json::from_str(&raw)?;
            change(&mut record)?;
            let updated = serde_json::to_string(&record)?;

            let reply: String = self
                .compare_and_set
                .key(&key)
                .arg(&raw)
                .arg(&updated)
                .invoke_async(&mut con)
                .await?;

            match parse_reply(&reply)? {
                ScriptReply::Applied(stored) => return Ok(stored),
                ScriptReply::Missing => return Err(StoreError::NotFound(tracking_id.to_string())),
                ScriptReply::Stale => {
                    tracing::debug!(tracking_id, "order changed concurrently, retrying update");
                }
            }
        }

        Err(StoreError::Backend(format!(
            "order {} still contended after {} attempts",
            tracking_id, MAX_CAS_ATTEMPTS
        )))
    }
}

#[async_trait]
impl OrderStore for RedisOrderStore {
    async fn insert(&self, record: OrderRecord) -> Result<OrderRecord, StoreError> {
        let mut con = self.connection().await?;
        let json = serde_json::to_string(&record)?;

        let created: i64 = self
            .insert
            .key(order_key(&record.tracking_id))
            .key(requester_key(record.resource_ref, &record.requester_email))
            .arg(json)
            .arg(record.created_at.timestamp_millis())
            .arg(&record.tracking_id)
            .invoke_async(&mut con)
            .await?;

        if created == 0 {
            return Err(StoreError::DuplicateTrackingId(record.tracking_id));
        }
        Ok(record)
    }

    async fn get(&self, tracking_id: &str) -> Result<Option<OrderRecord>, StoreError> {
        let mut con = self.connection().await?;
        let raw: Option<String> = con.get(order_key(tracking_id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn latest_for(
        &self,
        resource_ref: ResourceRef,
        email: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        let latest: Vec<String> = {
            let mut con = self.connection().await?;
            con.zrevrange(requester_key(resource_ref, email), 0, 0)
                .await?
        };
        match latest.first() {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn apply_transition(
        &self,
        tracking_id: &str,
        transition: Transition,
    ) -> Result<OrderRecord, StoreError> {
        self.update(tracking_id, |record| {
            if record.status.is_terminal() {
                return Err(StoreError::AlreadyTerminal(Box::new(record.clone())));
            }
            record.apply(&transition, Utc::now());
            Ok(())
        })
        .await
    }

    async fn mark_notified(
        &self,
        tracking_id: &str,
        gateway_transaction_id: Option<&str>,
    ) -> Result<OrderRecord, StoreError> {
        self.update(tracking_id, |record| {
            record.mark_notified(gateway_transaction_id, Utc::now());
            Ok(())
        })
        .await
    }
}
