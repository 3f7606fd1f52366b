//! In-process rate limiting and abuse-escalation blocking.
//!
//! No teacher or pack repo reaches for a KV store for this; grounded instead
//! on `dashmap` for windowed counters with TTL, mirroring the original
//! `rate_limiter.py`'s key scheme (`conn:<ip>`, `hour:<id>`, `day:<id>`,
//! `auth:<ip>`, `blocked:<id>`).

use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use dashmap::DashMap;

const BOUNCE_THRESHOLD: u32 = 10;
const BOUNCE_WINDOW: Duration = Duration::from_secs(24 * 3600);
const BOUNCE_BLOCK: Duration = Duration::from_secs(3600);

const SPAM_REPORT_THRESHOLD: u32 = 3;
const SPAM_REPORT_WINDOW: Duration = Duration::from_secs(24 * 3600);
const SPAM_REPORT_BLOCK: Duration = Duration::from_secs(24 * 3600);

struct Window {
    count: u32,
    resets_at: Instant,
}

struct Block {
    until: Instant,
}

/// Counters are keyed by an owned string matching the original's key scheme
/// so a single map can serve every counter class.
pub struct RateLimiter {
    counters: DashMap<String, Window>,
    blocks: DashMap<String, Block>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            blocks: DashMap::new(),
        }
    }

    fn bump(&self, key: String, window: Duration, limit: u32) -> bool {
        let now = Instant::now();
        let mut entry = self.counters.entry(key).or_insert_with(|| Window {
            count: 0,
            resets_at: now + window,
        });
        if now >= entry.resets_at {
            entry.count = 0;
            entry.resets_at = now + window;
        }
        entry.count += 1;
        entry.count <= limit
    }

    /// `conn:<ip>` — connections per IP, limited by a per-second rate
    /// expressed as `max_connection_rate` per minute window.
    pub fn allow_connection(&self, ip: IpAddr, max_per_minute: u32) -> bool {
        self.bump(format!("conn:{ip}"), Duration::from_secs(60), max_per_minute)
    }

    /// `hour:<id>` — messages per user per hour.
    pub fn allow_message_hourly(&self, user_id: &str, max_per_hour: u32) -> bool {
        self.bump(format!("hour:{user_id}"), Duration::from_secs(3600), max_per_hour)
    }

    /// `day:<id>` — messages per user per day.
    pub fn allow_message_daily(&self, user_id: &str, max_per_day: u32) -> bool {
        self.bump(format!("day:{user_id}"), Duration::from_secs(24 * 3600), max_per_day)
    }

    /// `auth:<ip>` — authentication attempts per IP within a 15-minute
    /// window, matching the original's `rate_limiter.py` auth bucket.
    pub fn allow_auth_attempt(&self, ip: IpAddr, max_attempts: u32) -> bool {
        self.bump(format!("auth:{ip}"), Duration::from_secs(900), max_attempts)
    }

    /// `blocked:<id>` — is `id` (an IP or user id, stringified by the
    /// caller) currently blocked by an escalation?
    pub fn is_blocked(&self, id: &str) -> bool {
        match self.blocks.get(id) {
            Some(block) if Instant::now() < block.until => true,
            Some(_) => {
                self.blocks.remove(id);
                false
            }
            None => false,
        }
    }

    fn record_escalating(&self, counter_key: String, id: &str, window: Duration, threshold: u32, block_for: Duration) {
        if !self.bump(counter_key, window, threshold) {
            self.blocks.insert(
                id.to_owned(),
                Block {
                    until: Instant::now() + block_for,
                },
            );
        }
    }

    /// Records a bounce for `id`; escalates to a one-hour block at
    /// `BOUNCE_THRESHOLD` bounces within `BOUNCE_WINDOW`.
    pub fn record_bounce(&self, id: &str) {
        self.record_escalating(
            format!("bounce:{id}"),
            id,
            BOUNCE_WINDOW,
            BOUNCE_THRESHOLD,
            BOUNCE_BLOCK,
        );
    }

    /// Records a spam report for `id`; escalates to a 24-hour block at
    /// `SPAM_REPORT_THRESHOLD` reports within `SPAM_REPORT_WINDOW`.
    pub fn record_spam_report(&self, id: &str) {
        self.record_escalating(
            format!("spam:{id}"),
            id,
            SPAM_REPORT_WINDOW,
            SPAM_REPORT_THRESHOLD,
            SPAM_REPORT_BLOCK,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn connection_limit_trips_after_threshold() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        for _ in 0..5 {
            assert!(limiter.allow_connection(ip, 5));
        }
        assert!(!limiter.allow_connection(ip, 5));
    }

    #[test]
    fn bounce_escalation_blocks_after_threshold() {
        let limiter = RateLimiter::new();
        for _ in 0..BOUNCE_THRESHOLD {
            limiter.record_bounce("user-1");
        }
        assert!(limiter.is_blocked("user-1"));
        assert!(!limiter.is_blocked("user-2"));
    }

    #[test]
    fn spam_report_escalation_blocks_after_threshold() {
        let limiter = RateLimiter::new();
        for _ in 0..SPAM_REPORT_THRESHOLD {
            limiter.record_spam_report("user-1");
        }
        assert!(limiter.is_blocked("user-1"));
    }

    #[test]
    fn independent_counters_do_not_interfere() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert!(limiter.allow_auth_attempt(ip, 3));
        assert!(limiter.allow_connection(ip, 3));
        assert!(limiter.allow_message_hourly("u1", 3));
        assert!(limiter.allow_message_daily("u1", 3));
    }
}
