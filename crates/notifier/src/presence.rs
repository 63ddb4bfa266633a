use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Where a user's live socket is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub instance_id: Uuid,
    pub channel: String,
}

const RELEASE_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return 0
end
local record = cjson.decode(raw)
if record.instance_id == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

const REFRESH_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then
    return -1
end
local record = cjson.decode(raw)
if record.instance_id == ARGV[1] then
    redis.call('EXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
";

/// What a lease refresh found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRefresh {
    /// This instance still owns the lease and its TTL was extended.
    Extended,
    /// A different instance owns the lease now; leave it alone.
    NotOwner,
    /// No lease exists. The caller may re-claim if it still holds the
    /// user's socket.
    Missing,
}

/// Cross-instance map of user id to the instance holding their socket.
///
/// Entries are leases, not permanent rows: every claim carries a TTL and the
/// owning instance refreshes it on each heartbeat, so a crashed instance's
/// claims age out on their own. Release and refresh are owner-guarded in Lua
/// so an instance can never delete or extend a lease a newer claim replaced.
#[derive(Clone)]
pub enum PresenceDirectory {
    Redis { conn: ConnectionManager, ttl: Duration },
    Memory(Arc<RwLock<HashMap<Uuid, (PresenceRecord, DateTime<Utc>)>>>),
}

impl PresenceDirectory {
    pub fn redis(conn: ConnectionManager, ttl: Duration) -> Self {
        Self::Redis { conn, ttl }
    }

    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(HashMap::new())))
    }

    fn key(user_id: Uuid) -> String {
        format!("presence:{user_id}")
    }

    /// Claim the user's presence lease for this instance, overwriting any
    /// previous claim. Last writer wins on reconnect races.
    pub async fn claim(&self, user_id: Uuid, record: &PresenceRecord) -> anyhow::Result<()> {
        match self {
            Self::Redis { conn, ttl } => {
                let payload = serde_json::to_string(record)
                    .context("failed to serialize presence record")?;
                let mut conn = conn.clone();
                conn.set_ex::<_, _, ()>(Self::key(user_id), payload, ttl.as_secs())
                    .await
                    .context("failed to claim presence lease")?;
                Ok(())
            }
            Self::Memory(entries) => {
                entries.write().await.insert(user_id, (record.clone(), Utc::now()));
                Ok(())
            }
        }
    }

    pub async fn lookup(&self, user_id: Uuid) -> anyhow::Result<Option<PresenceRecord>> {
        match self {
            Self::Redis { conn, .. } => {
                let mut conn = conn.clone();
                let raw: Option<String> = conn
                    .get(Self::key(user_id))
                    .await
                    .context("failed to look up presence lease")?;
                match raw {
                    Some(raw) => {
                        let record = serde_json::from_str(&raw)
                            .context("presence record is not valid JSON")?;
                        Ok(Some(record))
                    }
                    None => Ok(None),
                }
            }
            Self::Memory(entries) => Ok(entries
                .read()
                .await
                .get(&user_id)
                .map(|(record, _claimed_at)| record.clone())),
        }
    }

    /// Drop the user's lease, but only if this instance still owns it.
    pub async fn release(&self, user_id: Uuid, instance_id: Uuid) -> anyhow::Result<()> {
        match self {
            Self::Redis { conn, .. } => {
                let mut conn = conn.clone();
                Script::new(RELEASE_SCRIPT)
                    .key(Self::key(user_id))
                    .arg(instance_id.to_string())
                    .invoke_async::<i64>(&mut conn)
                    .await
                    .context("failed to release presence lease")?;
                Ok(())
            }
            Self::Memory(entries) => {
                let mut entries = entries.write().await;
                if let Some((record, _claimed_at)) = entries.get(&user_id) {
                    if record.instance_id == instance_id {
                        entries.remove(&user_id);
                    }
                }
                Ok(())
            }
        }
    }

    /// Extend the lease TTL if this instance still owns it. Called on each
    /// heartbeat tick of the user's socket; a `Missing` result tells the
    /// caller the lease expired (or was never claimed) and should be
    /// re-claimed while the socket is still live.
    pub async fn refresh(&self, user_id: Uuid, instance_id: Uuid) -> anyhow::Result<LeaseRefresh> {
        match self {
            Self::Redis { conn, ttl } => {
                let mut conn = conn.clone();
                let outcome = Script::new(REFRESH_SCRIPT)
                    .key(Self::key(user_id))
                    .arg(instance_id.to_string())
                    .arg(ttl.as_secs())
                    .invoke_async::<i64>(&mut conn)
                    .await
                    .context("failed to refresh presence lease")?;
                Ok(match outcome {
                    1 => LeaseRefresh::Extended,
                    -1 => LeaseRefresh::Missing,
                    _ => LeaseRefresh::NotOwner,
                })
            }
            Self::Memory(entries) => {
                let mut entries = entries.write().await;
                Ok(match entries.get_mut(&user_id) {
                    Some(entry) if entry.0.instance_id == instance_id => {
                        entry.1 = Utc::now();
                        LeaseRefresh::Extended
                    }
                    Some(_) => LeaseRefresh::NotOwner,
                    None => LeaseRefresh::Missing,
                })
            }
        }
    }
}
