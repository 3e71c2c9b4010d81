use redis::RedisResult;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

fn batch_lock_key(job: &str, campaign_id: Uuid) -> String {
    format!("batch:{}:{}", job, campaign_id)
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    /// Keeps two workers from running the same batch job on one campaign.
    /// Returns false when another holder has the lock.
    pub async fn acquire_batch_lock(
        &self,
        job: &str,
        campaign_id: Uuid,
        holder: &str,
        ttl_seconds: u64,
    ) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = batch_lock_key(job, campaign_id);

        // SET NX: only set if key does not exist
        let result: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await?;

        if result.is_some() {
            info!("Batch lock acquired: {} by {}", key, holder);
        }
        Ok(result.is_some())
    }

    /// Deletes the lock only while `holder` still owns it.
    pub async fn release_batch_lock(&self, job: &str, campaign_id: Uuid, holder: &str) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = batch_lock_key(job, campaign_id);
        let script = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#,
        );

        let deleted: i64 = script.key(&key).arg(holder).invoke_async(&mut conn).await?;
        if deleted == 0 {
            warn!("Batch lock {} expired before {} released it", key, holder);
        }
        Ok(deleted == 1)
    }

    pub async fn check_rate_limit(&self, key: &str, limit: i64, window_seconds: i64) -> RedisResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let (count,): (i64,) = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, window_seconds)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count <= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_keys_are_scoped_per_job() {
        let campaign = Uuid::new_v4();
        assert_ne!(batch_lock_key("redistribute", campaign), batch_lock_key("reconcile", campaign));
        assert!(batch_lock_key("reconcile", campaign).ends_with(&campaign.to_string()));
    }
}
