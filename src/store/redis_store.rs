//! Redis backend. Each primitive is one script so it executes atomically.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use redis::{Script, aio::ConnectionManager};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{BucketReply, BucketRequest, WindowReply, WindowRequest, ttl_millis};
use crate::Result;

/// Prune, count, admit-if-room, refresh expiry.
/// Returns `{allowed, count, oldest_score_or_-1, room_score_or_-1}`.
static SLIDING_WINDOW: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local limit = tonumber(ARGV[3])
        local cost = tonumber(ARGV[4])
        local member = ARGV[5]

        redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
        local count = redis.call('ZCARD', key)
        local allowed = 0
        if count + cost <= limit then
            for i = 1, cost do
                redis.call('ZADD', key, now, member .. ':' .. i)
            end
            count = count + cost
            allowed = 1
        end
        redis.call('PEXPIRE', key, window)

        local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
        local oldest_score = -1
        if #oldest >= 2 then
            oldest_score = tonumber(oldest[2])
        end

        local room_score = -1
        local room_index = count + cost - limit - 1
        if allowed == 0 and room_index < count then
            local room = redis.call('ZRANGE', key, room_index, room_index, 'WITHSCORES')
            if #room >= 2 then
                room_score = tonumber(room[2])
            end
        end
        return {allowed, count, oldest_score, room_score}
        ",
    )
});

/// Refill by elapsed time (capped at burst), spend if enough, persist.
/// Returns `{allowed, tokens_as_string}`.
static TOKEN_BUCKET: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local rate = tonumber(ARGV[2])
        local burst = tonumber(ARGV[3])
        local cost = tonumber(ARGV[4])
        local ttl = tonumber(ARGV[5])

        local state = redis.call('HMGET', key, 'tokens', 'ts')
        local tokens = tonumber(state[1])
        local ts = tonumber(state[2])
        if tokens == nil or ts == nil then
            tokens = burst
            ts = now
        end

        local elapsed = math.max(0, now - ts)
        tokens = math.min(burst, tokens + elapsed * rate)
        local allowed = 0
        if tokens >= cost then
            tokens = tokens - cost
            allowed = 1
        end

        redis.call('HSET', key, 'tokens', tostring(tokens), 'ts', tostring(math.max(ts, now)))
        redis.call('PEXPIRE', key, ttl)
        return {allowed, tostring(tokens)}
        ",
    )
});

static INCR_WITH_TTL: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local v = redis.call('INCR', KEYS[1])
        redis.call('PEXPIRE', KEYS[1], ARGV[1])
        return v
        ",
    )
});

static DECR_FLOOR_ZERO: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local v = redis.call('DECR', KEYS[1])
        if v <= 0 then
            redis.call('DEL', KEYS[1])
            v = 0
        end
        return v
        ",
    )
});

/// Redis-backed store with a lazily established, auto-reconnecting connection
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl RedisStore {
    /// Create from a `redis://` URL. No connection is made yet.
    pub fn new(url: &str) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            conn: Arc::new(OnceCell::new()),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| {
                debug!("Connecting to Redis");
                ConnectionManager::new(self.client.clone())
            })
            .await?;
        Ok(conn.clone())
    }

    pub(super) async fn sliding_window(&self, req: &WindowRequest) -> Result<WindowReply> {
        let mut conn = self.conn().await?;
        let (allowed, count, oldest, room): (i64, i64, i64, i64) = SLIDING_WINDOW
            .key(&req.key)
            .arg(req.now_ms)
            .arg(req.window_ms)
            .arg(req.limit)
            .arg(req.cost)
            .arg(&req.member)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowReply {
            allowed: allowed == 1,
            count: u64::try_from(count).unwrap_or(0),
            oldest_ms: u64::try_from(oldest).ok(),
            room_at_ms: u64::try_from(room).ok(),
        })
    }

    pub(super) async fn token_bucket(&self, req: &BucketRequest) -> Result<BucketReply> {
        let mut conn = self.conn().await?;
        // Lua numbers are doubles; the rate is passed per millisecond.
        let (allowed, tokens): (i64, String) = TOKEN_BUCKET
            .key(&req.key)
            .arg(req.now_ms)
            .arg(req.rate_per_sec / 1000.0)
            .arg(req.burst)
            .arg(req.cost)
            .arg(req.ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(BucketReply {
            allowed: allowed == 1,
            tokens: tokens.parse::<f64>().unwrap_or(0.0).clamp(0.0, req.burst),
        })
    }

    pub(super) async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.conn().await?;
        let v: i64 = INCR_WITH_TTL
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(v)
    }

    pub(super) async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn().await?;
        let v: i64 = DECR_FLOOR_ZERO.key(key).invoke_async(&mut conn).await?;
        Ok(v)
    }

    pub(super) async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let v: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(v)
    }

    pub(super) async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub(super) async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        let n: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }
}
