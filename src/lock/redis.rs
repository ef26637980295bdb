use std::time::Duration;

use log::warn;
use rand::Rng;

use super::{LockManager, TopicLock, LOCK_TTL};

/// Lock manager over redis `SET key token NX PX ttl`.
///
/// The token ties the key to this holder so refresh and release never
/// touch a lock that expired and was re-taken by someone else.
pub struct RedisLockManager {
    client: redis::Client,
    prefix: String,
    ttl: Duration,
}

impl RedisLockManager {
    /// Creates a manager for the given redis URL; keys are
    /// `<prefix>/lock/<topic>`.
    pub fn new(url: &str, prefix: impl Into<String>) -> crate::Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            prefix: prefix.into(),
            ttl: LOCK_TTL,
        })
    }

    fn key(&self, topic: &str) -> String {
        format!("{}/lock/{topic}", self.prefix)
    }
}

fn try_acquire(
    client: &redis::Client,
    key: &str,
    token: &str,
    ttl: Duration,
) -> redis::RedisResult<bool> {
    let mut conn = client.get_connection()?;
    let reply: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(token)
        .arg("NX")
        .arg("PX")
        .arg(ttl.as_millis() as u64)
        .query(&mut conn)?;
    Ok(reply.is_some())
}

fn refresh_if_owner(
    client: &redis::Client,
    key: &str,
    token: &str,
    ttl: Duration,
) -> redis::RedisResult<bool> {
    let mut conn = client.get_connection()?;
    let current: Option<String> = redis::cmd("GET").arg(key).query(&mut conn)?;
    if current.as_deref() != Some(token) {
        return Ok(false);
    }
    let _: i64 = redis::cmd("PEXPIRE")
        .arg(key)
        .arg(ttl.as_millis() as u64)
        .query(&mut conn)?;
    Ok(true)
}

fn release_if_owner(client: &redis::Client, key: &str, token: &str) {
    let result: redis::RedisResult<()> = (|| {
        let mut conn = client.get_connection()?;
        let current: Option<String> = redis::cmd("GET").arg(key).query(&mut conn)?;
        if current.as_deref() == Some(token) {
            let _: i64 = redis::cmd("DEL").arg(key).query(&mut conn)?;
        }
        Ok(())
    })();
    if let Err(e) = result {
        warn!("cannot release lock {key}, leaving it to TTL expiry: {e}");
    }
}

impl LockManager for RedisLockManager {
    fn acquire_topic_lock(&self, topic: &str) -> Option<TopicLock> {
        let key = self.key(topic);
        let token: String = format!("{:032x}", rand::thread_rng().gen::<u128>());

        match try_acquire(&self.client, &key, &token, self.ttl) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                warn!("cannot acquire lock {key}: {e}");
                return None;
            }
        }

        let refresh_client = self.client.clone();
        let release_client = self.client.clone();
        let refresh_key = key.clone();
        let refresh_token = token.clone();
        let ttl = self.ttl;
        Some(TopicLock::spawn(
            topic,
            self.ttl / 3,
            move || {
                refresh_if_owner(&refresh_client, &refresh_key, &refresh_token, ttl)
                    .unwrap_or(false)
            },
            move || release_if_owner(&release_client, &key, &token),
        ))
    }
}
